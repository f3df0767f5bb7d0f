//! Log redaction for structured payloads

use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "privatekey",
    "private_key",
    "passphrase",
    "token",
    "accesstoken",
    "access_token",
    "secret",
    "key",
    "encryptionkey",
    "encryption_key",
    "authorization",
];

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str())
}

/// Clone `value`, replacing the value of every sensitive key at any depth
pub fn sanitize_log_data(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut clean = Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive(k) {
                    clean.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    clean.insert(k.clone(), sanitize_log_data(v));
                }
            }
            Value::Object(clean)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_log_data).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_redaction() {
        let input = json!({
            "type": "ssh_connect",
            "payload": {
                "config": {
                    "hostname": "example.com",
                    "password": "hunter2",
                    "privateKey": "-----BEGIN...",
                    "passphrase": "pp"
                },
                "tokens": [{"token": "abc"}, {"name": "ok"}]
            }
        });

        let clean = sanitize_log_data(&input);
        let config = &clean["payload"]["config"];
        assert_eq!(config["hostname"], "example.com");
        assert_eq!(config["password"], REDACTED);
        assert_eq!(config["privateKey"], REDACTED);
        assert_eq!(config["passphrase"], REDACTED);
        assert_eq!(clean["payload"]["tokens"][0]["token"], REDACTED);
        assert_eq!(clean["payload"]["tokens"][1]["name"], "ok");

        // Input untouched
        assert_eq!(input["payload"]["config"]["password"], "hunter2");
    }

    #[test]
    fn test_container_values_redacted_whole() {
        let clean = sanitize_log_data(&json!({"secret": {"inner": 1}}));
        assert_eq!(clean["secret"], REDACTED);
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(sanitize_log_data(&json!("password")), json!("password"));
        assert_eq!(sanitize_log_data(&json!(42)), json!(42));
        assert_eq!(sanitize_log_data(&Value::Null), Value::Null);
    }

    #[test]
    fn test_similar_keys_not_redacted() {
        let clean = sanitize_log_data(&json!({"keyboard": "us", "sessionId": "s1"}));
        assert_eq!(clean["keyboard"], "us");
        assert_eq!(clean["sessionId"], "s1");
    }
}
