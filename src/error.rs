//! Error types for pipeline assembly and execution.
//!
//! Two layers:
//! - [`ConfigError`] covers everything detected while a pipeline is being
//!   assembled. These are always raised before the first record is routed.
//! - [`PipelineError`] is what routing returns. Failures from stage logic and
//!   sink writes propagate through it unchanged; the engine never retries.
//!
//! Stage logic itself returns [`StageError`], which separates a stage's own
//! failure from an error that bubbled up out of a downstream emit.

use std::time::Duration;

use thiserror::Error;

/// Boxed error used at plugin and collector boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias defaulting to [`PipelineError`].
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Result of one invocation of stage logic.
pub type StageResult = std::result::Result<(), StageError>;

/// Errors raised while driving records through a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// User stage logic failed.
    #[error("stage '{stage}' failed: {source}")]
    Plugin {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// A sink's output collector rejected a write.
    #[error("sink '{stage}' failed to write: {source}")]
    Storage {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// The pipeline could not be assembled.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Stage construction for a partition did not finish in time.
    #[error("stage setup for partition {partition} exceeded {timeout:?}")]
    SetupTimeout { partition: usize, timeout: Duration },

    /// A partition worker panicked before reporting a result.
    #[error("partition {partition} panicked")]
    PartitionPanicked { partition: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems found while assembling a pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pipeline declares no root stages")]
    NoRoots,

    #[error("root stage '{0}' is not part of the pipeline")]
    UnknownRoot(String),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("stage '{stage}' does not accept records of type {expected}")]
    TypeMismatch {
        stage: String,
        expected: &'static str,
    },

    #[error("sink '{0}' cannot declare downstream stages")]
    SinkWithDownstream(String),

    #[error("stage '{0}' has no downstream stages")]
    NoDownstream(String),

    #[error("sink '{0}' has no output collector")]
    MissingCollector(String),

    #[error("stage '{0}' is not a sink but was given an output collector")]
    UnexpectedCollector(String),

    #[error("stage '{0}' is not a sink")]
    NotASink(String),

    #[error("aggregator '{0}' must run through a grouping step, not the per-record path")]
    AggregatorInRecordPath(String),

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("plugin '{plugin}' does not produce {expected}")]
    PluginTypeMismatch {
        plugin: String,
        expected: &'static str,
    },

    #[error("stage '{stage}' rejected its properties: {reason}")]
    InvalidProperty { stage: String, reason: String },

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("stage '{0}' is not an aggregator")]
    NotAnAggregator(String),

    #[error("aggregator '{0}' has no grouping declared for its record types")]
    UngroupedAggregator(String),

    #[error("sink '{sink}' does not hold records of type {expected}")]
    OutputTypeMismatch {
        sink: String,
        expected: &'static str,
    },
}

/// Failure reported by stage logic.
///
/// `emitter.emit(..)?` converts a downstream failure into
/// [`StageError::Pipeline`], which the tracked stage passes on untouched.
/// A stage reports its own failure with [`StageError::failed`].
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    Failed(BoxError),
}

impl StageError {
    /// Wrap the stage's own failure.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        StageError::Failed(err.into())
    }

    /// Resolve into a [`PipelineError`], tagging the stage's own failures
    /// with its name.
    pub fn into_pipeline_error(self, stage: &str) -> PipelineError {
        match self {
            StageError::Pipeline(err) => err,
            StageError::Failed(source) => PipelineError::Plugin {
                stage: stage.to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_failure_is_tagged_with_stage() {
        let err = StageError::failed("boom").into_pipeline_error("parse");
        match err {
            PipelineError::Plugin { stage, source } => {
                assert_eq!(stage, "parse");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_downstream_failure_passes_through() {
        let downstream = PipelineError::Storage {
            stage: "sink1".to_string(),
            source: "disk full".into(),
        };
        let err = StageError::from(downstream).into_pipeline_error("transform1");
        assert!(matches!(err, PipelineError::Storage { ref stage, .. } if stage == "sink1"));
    }

    #[test]
    fn test_config_error_message() {
        let err = PipelineError::from(ConfigError::UnknownRoot("src".to_string()));
        assert_eq!(
            err.to_string(),
            "configuration error: root stage 'src' is not part of the pipeline"
        );
    }
}
