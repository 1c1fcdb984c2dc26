use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The job description serialized into a queue list. The `args` field is a
/// one-element array wrapping the real argument object (or `null`) — this
/// double-wrapping is a deliberate wire-compatibility quirk, not a bug:
/// existing producers and consumers expect it, so it must round-trip
/// exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub class: String,
    pub args: [Value; 1],
    pub id: String,
    #[serde(default)]
    pub prefix: String,
    pub queue_time: f64,
}

impl Envelope {
    pub fn new(class: impl Into<String>, args: Value, prefix: impl Into<String>) -> Self {
        Envelope {
            class: class.into(),
            args: [args],
            id: generate_id(),
            prefix: prefix.into(),
            queue_time: now_secs(),
        }
    }

    pub fn argument(&self) -> &Value {
        &self.args[0]
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// 128-bit random id, hex-encoded, matching the wire contract exactly.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_secs() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_bitwise_on_the_fields_that_matter() {
        let env = Envelope::new("Echo", json!({"msg": "hi"}), "");
        let encoded = env.to_json().expect("encode");
        let decoded = Envelope::from_json(&encoded).expect("decode");
        assert_eq!(env, decoded);
    }

    #[test]
    fn args_is_single_element_wrapping_the_real_payload() {
        let env = Envelope::new("Echo", json!({"msg": "hi"}), "");
        let encoded = env.to_json().unwrap();
        let raw: Value = serde_json::from_str(&encoded).unwrap();
        let args = raw.get("args").unwrap().as_array().unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0], json!({"msg": "hi"}));
    }

    #[test]
    fn null_argument_is_preserved() {
        let env = Envelope::new("Noop", Value::Null, "");
        let encoded = env.to_json().unwrap();
        let decoded = Envelope::from_json(&encoded).unwrap();
        assert_eq!(decoded.argument(), &Value::Null);
    }

    #[test]
    fn generated_ids_are_128_bit_hex() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
