//! Canonical JSON and content addressing for event envelopes.
//!
//! Object keys are sorted by code point and no whitespace is emitted, so two
//! processes serializing the same event always hash the same bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(obj) => {
            let mut entries: Vec<(&String, &Value)> = obj.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single compact rendering.
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Content id of an envelope: SHA-256 over the canonical body
/// `{emittedAt, event, from, version}`.
pub fn content_id(version: u32, from: &str, emitted_at: &str, event: &Value) -> String {
    let body = serde_json::json!({
        "version": version,
        "from": from,
        "emittedAt": emitted_at,
        "event": event,
    });
    sha256_hex(canonical_json(&body).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_sorted_without_whitespace() {
        let v = json!({"b": 1, "a": [true, null, {"d": "x", "c": 2}]});
        assert_eq!(canonical_json(&v), r#"{"a":[true,null,{"c":2,"d":"x"}],"b":1}"#);
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"k\"ey": "line\nbreak"});
        assert_eq!(canonical_json(&v), r#"{"k\"ey":"line\nbreak"}"#);
    }

    #[test]
    fn content_id_ignores_key_order() {
        let a = json!({"kind": "released", "ip": "5010"});
        let b = json!({"ip": "5010", "kind": "released"});
        assert_eq!(
            content_id(1, "n", "2024-01-01T00:00:00Z", &a),
            content_id(1, "n", "2024-01-01T00:00:00Z", &b)
        );
        assert_ne!(
            content_id(1, "n", "2024-01-01T00:00:00Z", &a),
            content_id(1, "m", "2024-01-01T00:00:00Z", &a)
        );
    }

    #[test]
    fn sha256_of_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
