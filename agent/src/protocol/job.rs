use crate::scheduler::JobClass;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Reasons an inbound frame cannot become a job.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame is missing string field `{0}`")]
    MissingField(&'static str),
}

/// Handler address: module plus action within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandId {
    pub module: String,
    pub action: String,
}

impl CommandId {
    pub fn new(module: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.action)
    }
}

/// Inbound unit of work, immutable once decoded.
#[derive(Debug, Clone)]
pub struct JobMessage {
    /// Admission class derived from `job_type`
    pub class: JobClass,
    pub command: CommandId,
    /// Parameters for the handler, opaque to the dispatcher
    pub arguments: Value,
    /// Origin token echoed back with the result
    pub context: Option<Value>,
    /// Full decoded frame
    pub payload: Map<String, Value>,
}

impl JobMessage {
    /// Decode a text frame.
    ///
    /// Parameters are read from `arguments`, falling back to `config`.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let payload = match serde_json::from_str::<Value>(frame)? {
            Value::Object(payload) => payload,
            _ => return Err(DecodeError::NotAnObject),
        };

        let module = string_field(&payload, "module_name")?;
        let action = string_field(&payload, "module_command")?;
        let class = JobClass::from_job_type(payload.get("job_type").and_then(Value::as_str));

        let arguments = payload
            .get("arguments")
            .or_else(|| payload.get("config"))
            .filter(|value| !value.is_null())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let context = payload.get("context").filter(|v| !v.is_null()).cloned();

        Ok(JobMessage {
            class,
            command: CommandId::new(module, action),
            arguments,
            context,
            payload,
        })
    }

    /// Look up a field of the raw frame.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

fn string_field(payload: &Map<String, Value>, name: &'static str) -> Result<String, DecodeError> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(DecodeError::MissingField(name))
}
