//! Shared data model: records, output declarations, execution configuration
//! and engine snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An input or output record.
pub type Record = serde_json::Map<String, Value>;

/// Reserved field carrying the 1-based index of the step being executed.
pub const STEP_FIELD: &str = "step";

/// Declared result type of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    /// Any type this crate does not interpret.
    #[serde(other)]
    Other,
}

/// Descriptor of a single declared output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<OutputType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub axes: Vec<String>,
}

/// Outputs an engine must compute on every step, keyed by name.
pub type OutputSpec = BTreeMap<String, OutputField>;

/// Copies an output value into an input field for the next iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackMapping {
    pub from_output: String,
    pub to_input: String,
}

impl FeedbackMapping {
    pub fn new(from_output: impl Into<String>, to_input: impl Into<String>) -> Self {
        Self {
            from_output: from_output.into(),
            to_input: to_input.into(),
        }
    }
}

/// Settings for continuous (fed-back) execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousConfig {
    #[serde(default)]
    pub feedback_mappings: Vec<FeedbackMapping>,
    /// Milliseconds between autoplay steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_speed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub auto_start: bool,
}

/// How an engine derives the next input from the previous step.
///
/// Wire form: `{"type": "single"}` or
/// `{"type": "continuous", "continuous": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "continuous", rename_all = "lowercase")]
pub enum ExecutionConfig {
    #[default]
    Single,
    Continuous(ContinuousConfig),
}

impl ExecutionConfig {
    /// Continuous config with the given feedback mappings and no pacing hints.
    pub fn continuous(feedback_mappings: Vec<FeedbackMapping>) -> Self {
        Self::Continuous(ContinuousConfig {
            feedback_mappings,
            ..Default::default()
        })
    }

    /// Feedback mappings in effect; empty for `Single`.
    pub fn feedback_mappings(&self) -> &[FeedbackMapping] {
        match self {
            Self::Single => &[],
            Self::Continuous(c) => &c.feedback_mappings,
        }
    }

    pub fn max_iterations(&self) -> Option<u64> {
        match self {
            Self::Single => None,
            Self::Continuous(c) => c.max_iterations,
        }
    }

    pub fn playback_speed(&self) -> Option<Duration> {
        match self {
            Self::Single => None,
            Self::Continuous(c) => c.playback_speed.map(Duration::from_millis),
        }
    }

    pub fn auto_start(&self) -> bool {
        matches!(self, Self::Continuous(c) if c.auto_start)
    }
}

/// State surfaced to callers after every step.
///
/// Immutable: each step produces a fresh snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub step_count: u64,
    pub input: Record,
    pub outputs: Option<Record>,
    pub error: Option<String>,
}

impl EngineSnapshot {
    /// Copy of this snapshot carrying `error`, keeping everything else.
    pub fn with_error(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.clone()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Type declaration of an input field, as produced by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputField {
    String,
    Integer,
    Float,
    Boolean,
    Array { element: Box<InputField> },
    Object { fields: BTreeMap<String, InputField> },
}

/// Input form schema, keyed by top-level field name.
pub type InputSchema = BTreeMap<String, InputField>;

/// Compiler service response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileResult {
    #[serde(default)]
    pub artifact_url: Option<String>,
    #[serde(default)]
    pub output_schema: OutputSpec,
    #[serde(default)]
    pub input_form_schema: InputSchema,
}
