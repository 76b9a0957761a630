use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON message exchanged with the hub.
///
/// `arguments` holds the effective parameters and may be overridden after
/// construction; `base_arguments` keeps what was originally supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEnvelope")]
pub struct Envelope {
    pub message_type: String,
    pub module_name: String,
    pub module_command: String,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub data: Value,
    pub arguments: Value,
    pub base_arguments: Value,
}

/// Wire shape before argument fallbacks are applied.
#[derive(Deserialize)]
struct RawEnvelope {
    message_type: String,
    module_name: String,
    module_command: String,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default)]
    base_arguments: Option<Value>,
}

impl From<RawEnvelope> for Envelope {
    fn from(raw: RawEnvelope) -> Self {
        let (arguments, base_arguments) = match (raw.arguments, raw.base_arguments) {
            (Some(arguments), Some(base)) => (arguments, base),
            (Some(arguments), None) => (arguments.clone(), arguments),
            (None, Some(base)) => (base.clone(), base),
            (None, None) => (empty_object(), empty_object()),
        };

        Envelope {
            message_type: raw.message_type,
            module_name: raw.module_name,
            module_command: raw.module_command,
            timestamp: raw.timestamp.unwrap_or_else(now_secs),
            data: raw.data.unwrap_or_else(default_data),
            arguments,
            base_arguments,
        }
    }
}

impl Envelope {
    pub fn new(
        message_type: impl Into<String>,
        module_name: impl Into<String>,
        module_command: impl Into<String>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            module_name: module_name.into(),
            module_command: module_command.into(),
            timestamp: now_secs(),
            data: default_data(),
            arguments: empty_object(),
            base_arguments: empty_object(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set both the supplied and the effective arguments.
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.base_arguments = arguments.clone();
        self.arguments = arguments;
        self
    }

    /// Override the effective arguments, keeping `base_arguments` intact.
    pub fn override_arguments(&mut self, arguments: Value) {
        self.arguments = arguments;
    }

    /// Append an encoded image to `data.images`.
    pub fn push_image(&mut self, encoded: String) {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        if let Value::Object(data) = &mut self.data {
            let images = data
                .entry("images")
                .or_insert_with(|| Value::Array(Vec::new()));
            match images {
                Value::Array(images) => images.push(Value::String(encoded)),
                other => *other = Value::Array(vec![Value::String(encoded)]),
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

fn default_data() -> Value {
    json!({ "images": [] })
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_envelope_defaults() {
        let envelope = Envelope::new("hello_world", "worker", "register");

        assert_eq!(envelope.data, json!({ "images": [] }));
        assert_eq!(envelope.arguments, json!({}));
        assert_eq!(envelope.base_arguments, json!({}));
        assert!(envelope.timestamp > 0.0);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let mut original = Envelope::new("job_result", "image_generation", "generate")
            .with_arguments(json!({ "model_id": "sd-1.5", "steps": 30 }));
        original.override_arguments(json!({ "model_id": "sd-1.5", "steps": 20 }));
        original.push_image("aGVsbG8=".to_string());

        let decoded = Envelope::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.base_arguments["steps"], 30);
        assert_eq!(decoded.arguments["steps"], 20);
    }

    #[test]
    fn test_timestamp_survives_encoding() {
        let base_micros: i64 = 1_700_000_000_123_456;
        for step in 0..20_000i64 {
            let mut envelope = Envelope::new("job_result", "system", "update");
            envelope.timestamp = (base_micros + step * 7_919) as f64 / 1_000_000.0;

            let decoded = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
            assert_eq!(
                decoded.timestamp.to_bits(),
                envelope.timestamp.to_bits(),
                "timestamp {} changed",
                envelope.timestamp
            );
        }
    }

    #[test]
    fn test_missing_arguments_fall_back_to_base() {
        let text = r#"{
            "message_type": "job",
            "module_name": "system",
            "module_command": "hardware_info",
            "timestamp": 1700000000.5,
            "base_arguments": {"verbose": true}
        }"#;

        let envelope = Envelope::from_json(text).unwrap();
        assert_eq!(envelope.arguments, json!({ "verbose": true }));
        assert_eq!(envelope.base_arguments, json!({ "verbose": true }));
        assert_eq!(envelope.timestamp, 1700000000.5);
        assert_eq!(envelope.data, json!({ "images": [] }));
    }

    #[test]
    fn test_missing_base_arguments_fall_back_to_arguments() {
        let text = r#"{
            "message_type": "job",
            "module_name": "system",
            "module_command": "hardware_info",
            "arguments": {"verbose": false}
        }"#;

        let envelope = Envelope::from_json(text).unwrap();
        assert_eq!(envelope.base_arguments, json!({ "verbose": false }));
        assert!(envelope.timestamp > 0.0);
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let text = r#"{"message_type": "job", "module_name": "system"}"#;
        assert!(Envelope::from_json(text).is_err());
    }

    #[test]
    fn test_push_image_repairs_data() {
        let mut envelope = Envelope::new("job_result", "image_generation", "generate")
            .with_data(json!({ "images": "not-a-list" }));
        envelope.push_image("abc".to_string());
        assert_eq!(envelope.data["images"], json!(["abc"]));

        let mut envelope = envelope.with_data(Value::Null);
        envelope.push_image("def".to_string());
        assert_eq!(envelope.data, json!({ "images": ["def"] }));
    }
}
