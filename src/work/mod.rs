//! Work functions and result sinks.
//!
//! A work function is the pluggable unit that actually does something with
//! a task's parameters. The engine never looks inside parameters or
//! results; it only needs the parameter schema (to reject malformed tasks
//! before running them) and the error classification (to decide whether a
//! failure is worth retrying).

pub mod command;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::TaskId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a work function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// Parameters do not match the expected shape. Never retried.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// Network, timeout, rate limit. Retried up to `max_retries`.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Anything else. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl WorkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

/// JSON type of a parameter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl ParamKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
            ParamKind::Any => true,
        }
    }

    fn json_type(self) -> Option<&'static str> {
        match self {
            ParamKind::String => Some("string"),
            ParamKind::Integer => Some("integer"),
            ParamKind::Number => Some("number"),
            ParamKind::Bool => Some("boolean"),
            ParamKind::Object => Some("object"),
            ParamKind::Array => Some("array"),
            ParamKind::Any => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamField {
    pub kind: ParamKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Expected shape of a task's parameters: a JSON object with typed fields.
/// Unknown fields are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema {
    fields: BTreeMap<String, ParamField>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.fields.insert(
            name.into(),
            ParamField {
                kind,
                required: true,
            },
        );
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.fields.insert(
            name.into(),
            ParamField {
                kind,
                required: false,
            },
        );
        self
    }

    /// Check `params` against the schema. Returns the first mismatch.
    pub fn validate(&self, params: &Value) -> std::result::Result<(), WorkError> {
        let Some(object) = params.as_object() else {
            return Err(WorkError::Validation(
                "parameters must be a JSON object".to_string(),
            ));
        };

        for (name, field) in &self.fields {
            match object.get(name) {
                None | Some(Value::Null) if field.required => {
                    return Err(WorkError::Validation(format!(
                        "missing required field `{name}`"
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.matches(value) => {
                    return Err(WorkError::Validation(format!(
                        "field `{name}` should be {:?}, got {value}",
                        field.kind
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// JSON Schema rendering, sent to the registry on registration.
    pub fn to_json(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, field)| {
                let prop = match field.kind.json_type() {
                    Some(ty) => json!({ "type": ty }),
                    None => json!({}),
                };
                (name.clone(), prop)
            })
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|(_, f)| f.required)
            .map(|(name, _)| name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ---------------------------------------------------------------------------
// Work function
// ---------------------------------------------------------------------------

/// Executes tasks of one type.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    /// Expected parameter shape, checked before `execute` is called.
    fn schema(&self) -> ParamSchema {
        ParamSchema::new()
    }

    /// Version string reported to the registry.
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// Run the task. The returned value becomes the result payload.
    async fn execute(&self, params: &Value) -> std::result::Result<Value, WorkError>;
}

/// Work functions indexed by task type.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    functions: HashMap<String, Arc<dyn WorkFunction>>,
}

impl std::fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` for `task_type`, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, function: Arc<dyn WorkFunction>) {
        let task_type = task_type.into();
        debug!(task_type = %task_type, "work function registered");
        self.functions.insert(task_type, function);
    }

    pub fn with(mut self, task_type: impl Into<String>, function: impl WorkFunction + 'static) -> Self {
        self.register(task_type, Arc::new(function));
        self
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn WorkFunction>> {
        self.functions.get(task_type)
    }

    /// Registered task types in a stable order.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.functions.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Result sink
// ---------------------------------------------------------------------------

/// Downstream storage for successful results.
///
/// Called after the task is durably COMPLETED. A sink failure is logged and
/// does not change the task's outcome.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save_result(&self, task_id: TaskId, payload: &Value) -> Result<()>;
}

/// Writes each result to `<dir>/<task_id>.json`.
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ResultSink for JsonDirSink {
    async fn save_result(&self, task_id: TaskId, payload: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(payload)
            .map_err(|e| Error::Other(format!("serialize result: {e}")))?;
        let path = self.dir.join(format!("{task_id}.json"));
        tokio::fs::write(&path, body).await?;
        debug!(task_id = %task_id, path = %path.display(), "result saved");
        Ok(())
    }
}
