//! Serializable pipeline configuration.
//!
//! A [`PipelineConfig`] is the only description of a pipeline that crosses a
//! process or partition boundary: plugin ids, properties and wiring, never
//! live stage objects.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::stage::{Properties, StageDescriptor, StageKind};

/// One stage: which plugin to construct, how to configure it, and where its
/// output goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub kind: StageKind,
    pub plugin: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub downstream: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_dataset: Option<String>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: StageKind, plugin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            plugin: plugin.into(),
            properties: Properties::new(),
            downstream: Vec::new(),
            error_dataset: None,
        }
    }

    pub fn transform(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self::new(name, StageKind::Transform, plugin)
    }

    pub fn sink(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self::new(name, StageKind::Sink, plugin)
    }

    pub fn aggregator(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self::new(name, StageKind::Aggregator, plugin)
    }

    pub fn to<S: Into<String>>(mut self, downstream: impl IntoIterator<Item = S>) -> Self {
        self.downstream.extend(downstream.into_iter().map(Into::into));
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_error_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.error_dataset = Some(dataset.into());
        self
    }

    pub fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            name: self.name.clone(),
            kind: self.kind,
            downstream: self.downstream.clone(),
            error_dataset: self.error_dataset.clone(),
        }
    }
}

/// A whole pipeline: its entry stages and every stage config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub roots: Vec<String>,
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Parse and validate a JSON pipeline definition.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Structural checks that do not need the plugins themselves.
    /// Aggregator stages are rejected: they cannot run record at a time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check(false)
    }

    /// Like [`validate`](Self::validate), but aggregator stages are allowed
    /// anywhere a transform is, for drivers that run a grouping pass at each
    /// of them.
    pub fn validate_staged(&self) -> Result<(), ConfigError> {
        self.check(true)
    }

    /// Aggregator stages, upstream before downstream.
    pub fn aggregator_order(&self) -> Vec<&StageConfig> {
        let mut order: Vec<&StageConfig> = self
            .install_order()
            .into_iter()
            .filter(|stage| stage.kind == StageKind::Aggregator)
            .collect();
        order.reverse();
        order
    }

    /// The part of the pipeline reachable from `roots` without passing
    /// through an aggregator. Aggregator stages at its edge become sinks,
    /// which buffer their input for the grouping pass.
    pub fn segment<S: AsRef<str>>(&self, roots: &[S]) -> PipelineConfig {
        let mut members = HashSet::new();
        let mut pending: Vec<&str> = roots.iter().map(AsRef::as_ref).collect();
        while let Some(name) = pending.pop() {
            if !members.insert(name) {
                continue;
            }
            if let Some(stage) = self.stage(name)
                && stage.kind != StageKind::Aggregator
            {
                pending.extend(stage.downstream.iter().map(String::as_str));
            }
        }
        let stages = self
            .stages
            .iter()
            .filter(|stage| members.contains(stage.name.as_str()))
            .map(|stage| match stage.kind {
                StageKind::Aggregator => StageConfig {
                    kind: StageKind::Sink,
                    downstream: Vec::new(),
                    error_dataset: None,
                    ..stage.clone()
                },
                _ => stage.clone(),
            })
            .collect();
        PipelineConfig {
            roots: roots.iter().map(|root| root.as_ref().to_string()).collect(),
            stages,
        }
    }

    fn check(&self, aggregators: bool) -> Result<(), ConfigError> {
        if self.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
        }
        for root in &self.roots {
            if !names.contains(root.as_str()) {
                return Err(ConfigError::UnknownRoot(root.clone()));
            }
        }
        for stage in &self.stages {
            match stage.kind {
                StageKind::Sink if !stage.downstream.is_empty() => {
                    return Err(ConfigError::SinkWithDownstream(stage.name.clone()));
                }
                StageKind::Aggregator if !aggregators => {
                    return Err(ConfigError::AggregatorInRecordPath(stage.name.clone()));
                }
                StageKind::Source | StageKind::Transform | StageKind::Aggregator
                    if stage.downstream.is_empty() =>
                {
                    return Err(ConfigError::NoDownstream(stage.name.clone()));
                }
                _ => {}
            }
            if let Some(next) = stage
                .downstream
                .iter()
                .find(|next| !names.contains(next.as_str()))
            {
                return Err(ConfigError::UnknownStage(next.clone()));
            }
        }
        Ok(())
    }

    /// Stages ordered so that every stage comes after all of its downstream
    /// stages (sinks first).
    ///
    /// A back edge is skipped rather than followed, so a cyclic config
    /// produces an order in which some stage names a downstream that is not
    /// yet installed.
    pub fn install_order(&self) -> Vec<&StageConfig> {
        let by_name: HashMap<&str, &StageConfig> = self
            .stages
            .iter()
            .map(|stage| (stage.name.as_str(), stage))
            .collect();
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            visit(stage, &by_name, &mut visited, &mut order);
        }
        order
    }
}

fn visit<'a>(
    stage: &'a StageConfig,
    by_name: &HashMap<&str, &'a StageConfig>,
    visited: &mut HashSet<&'a str>,
    order: &mut Vec<&'a StageConfig>,
) {
    if !visited.insert(stage.name.as_str()) {
        return;
    }
    for next in &stage.downstream {
        if let Some(next) = by_name.get(next.as_str()) {
            visit(next, by_name, visited, order);
        }
    }
    order.push(stage);
}
