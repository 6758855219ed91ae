//! Built-in text-record plugins.
//!
//! Every built-in works on `String` records (one line of input each), so any
//! of them can be wired to any other in a JSON pipeline config.

use crate::emitter::{Emitter, ErrorRecord};
use crate::error::{BoxError, StageResult};
use crate::plugin::PluginRegistry;
use crate::stage::{Aggregator, Properties, Transform};

/// Error code emitted by `threshold` for values below the minimum.
pub const BELOW_THRESHOLD: i32 = 100;
/// Error code emitted by `threshold` when the field is not a number.
pub const NOT_A_NUMBER: i32 = 101;
/// Error code emitted by `count-by-key` when the key field is absent.
pub const MISSING_KEY: i32 = 102;

impl PluginRegistry {
    /// A registry holding every built-in plugin.
    pub fn with_builtins() -> Self {
        let mut registry = PluginRegistry::new();
        registry
            .register::<String, String, Console>("console")
            .register::<String, String, Console>("passthrough")
            .register::<String, String, Upper>("upper")
            .register::<String, String, Lower>("lower")
            .register::<String, String, Reverse>("reverse")
            .register::<String, String, Change>("change")
            .register::<String, String, Locate>("locate")
            .register::<String, String, Nlocate>("nlocate")
            .register::<String, String, Duplicate>("duplicate")
            .register::<String, String, Take>("take")
            .register::<String, String, Skip>("skip")
            .register::<String, String, Split>("split")
            .register::<String, String, Threshold>("threshold")
            .register_aggregator::<String, String, String, CountByKey>("count-by-key");
        registry
    }
}

fn required<'a>(properties: &'a Properties, key: &str) -> Result<&'a str, BoxError> {
    properties
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| format!("missing property '{key}'").into())
}

fn parsed<T>(properties: &Properties, key: &str, default: T) -> Result<T, BoxError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match properties.get(key) {
        Some(value) => value
            .parse()
            .map_err(|err| format!("property '{key}': {err}").into()),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Record transforms
// ---------------------------------------------------------------------------

/// console - passes records through unchanged.
#[derive(Default)]
pub struct Console;

impl Transform<String, String> for Console {
    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        emitter.emit(input)?;
        Ok(())
    }
}

/// upper - converts records to uppercase.
#[derive(Default)]
pub struct Upper;

impl Transform<String, String> for Upper {
    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        emitter.emit(input.to_uppercase())?;
        Ok(())
    }
}

/// lower - converts records to lowercase.
#[derive(Default)]
pub struct Lower;

impl Transform<String, String> for Lower {
    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        emitter.emit(input.to_lowercase())?;
        Ok(())
    }
}

/// reverse - reverses the characters of each record.
#[derive(Default)]
pub struct Reverse;

impl Transform<String, String> for Reverse {
    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        emitter.emit(input.trim_end().chars().rev().collect())?;
        Ok(())
    }
}

/// change {old, new} - replaces every occurrence of `old`.
#[derive(Default)]
pub struct Change {
    old: String,
    new: String,
}

impl Transform<String, String> for Change {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.old = required(properties, "old")?.to_string();
        if self.old.is_empty() {
            return Err("property 'old' must not be empty".into());
        }
        self.new = properties.get("new").cloned().unwrap_or_default();
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        emitter.emit(input.replace(&self.old, &self.new))?;
        Ok(())
    }
}

/// locate {pattern} - keeps records containing the pattern.
#[derive(Default)]
pub struct Locate {
    pattern: String,
}

impl Transform<String, String> for Locate {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.pattern = required(properties, "pattern")?.to_string();
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        if input.contains(&self.pattern) {
            emitter.emit(input)?;
        }
        Ok(())
    }
}

/// nlocate {pattern} - keeps records NOT containing the pattern.
#[derive(Default)]
pub struct Nlocate {
    pattern: String,
}

impl Transform<String, String> for Nlocate {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.pattern = required(properties, "pattern")?.to_string();
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        if !input.contains(&self.pattern) {
            emitter.emit(input)?;
        }
        Ok(())
    }
}

/// duplicate {n} - emits each record n times (default 2).
pub struct Duplicate {
    n: usize,
}

impl Default for Duplicate {
    fn default() -> Self {
        Self { n: 2 }
    }
}

impl Transform<String, String> for Duplicate {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.n = parsed(properties, "n", 2)?;
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        for record in std::iter::repeat_n(input, self.n) {
            emitter.emit(record)?;
        }
        Ok(())
    }
}

/// take {n} - keeps the first n records this instance sees.
#[derive(Default)]
pub struct Take {
    n: usize,
    seen: usize,
}

impl Transform<String, String> for Take {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.n = required(properties, "n")?.parse()?;
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        if self.seen < self.n {
            self.seen += 1;
            emitter.emit(input)?;
        }
        Ok(())
    }
}

/// skip {n} - drops the first n records this instance sees.
#[derive(Default)]
pub struct Skip {
    n: usize,
    seen: usize,
}

impl Transform<String, String> for Skip {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.n = required(properties, "n")?.parse()?;
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        if self.seen < self.n {
            self.seen += 1;
        } else {
            emitter.emit(input)?;
        }
        Ok(())
    }
}

/// split {separator} - emits one record per non-empty piece. Splits on
/// whitespace when no separator is given.
#[derive(Default)]
pub struct Split {
    separator: Option<String>,
}

impl Transform<String, String> for Split {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.separator = properties.get("separator").filter(|s| !s.is_empty()).cloned();
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        let pieces: Vec<&str> = match &self.separator {
            Some(separator) => input.split(separator.as_str()).collect(),
            None => input.split_whitespace().collect(),
        };
        for piece in pieces.into_iter().filter(|piece| !piece.is_empty()) {
            emitter.emit(piece.to_string())?;
        }
        Ok(())
    }
}

/// threshold {min, field} - keeps records whose numeric field is at least
/// `min`; everything else goes to the error channel.
#[derive(Default)]
pub struct Threshold {
    min: f64,
    field: usize,
}

impl Transform<String, String> for Threshold {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.min = required(properties, "min")?.parse()?;
        self.field = parsed(properties, "field", 0)?;
        Ok(())
    }

    fn transform(&mut self, input: String, emitter: &dyn Emitter<String, String>) -> StageResult {
        let value = input
            .split_whitespace()
            .nth(self.field)
            .and_then(|field| field.parse::<f64>().ok());
        match value {
            Some(value) if value >= self.min => emitter.emit(input)?,
            Some(_) => emitter.emit_error(ErrorRecord::new(
                BELOW_THRESHOLD,
                "less than threshold",
                input,
            )),
            None => emitter.emit_error(ErrorRecord::new(NOT_A_NUMBER, "not a number", input)),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Aggregators
// ---------------------------------------------------------------------------

/// count-by-key {field} - groups records by one whitespace-separated field
/// (the whole record when unset) and emits `"<key> <count>"` per group.
#[derive(Default)]
pub struct CountByKey {
    field: Option<usize>,
}

impl Aggregator<String, String, String> for CountByKey {
    fn configure(&mut self, properties: &Properties) -> Result<(), BoxError> {
        self.field = properties.get("field").map(|f| f.parse()).transpose()?;
        Ok(())
    }

    fn group_by(&mut self, input: &String, emitter: &dyn Emitter<String, String>) -> StageResult {
        let key = match self.field {
            Some(field) => input.split_whitespace().nth(field).map(str::to_string),
            None => Some(input.clone()),
        };
        match key {
            Some(key) => emitter.emit(key)?,
            None => emitter.emit_error(ErrorRecord::new(
                MISSING_KEY,
                "missing key field",
                input.clone(),
            )),
        }
        Ok(())
    }

    fn aggregate(
        &mut self,
        key: String,
        values: Vec<String>,
        emitter: &dyn Emitter<String, String>,
    ) -> StageResult {
        emitter.emit(format!("{key} {}", values.len()))?;
        Ok(())
    }
}
