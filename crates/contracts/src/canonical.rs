use hex::ToHex;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 64 {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Compact JSON with object keys sorted recursively; array order is
/// significant and preserved.
pub fn canonical_json_string(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json_string(value).as_bytes())
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        serde_json::Value::Number(v) => out.push_str(&v.to_string()),
        // Display on a string Value emits compact JSON with escaping.
        serde_json::Value::String(v) => {
            out.push_str(&serde_json::Value::String(v.clone()).to_string());
        }
        serde_json::Value::Array(values) => {
            out.push('[');
            for (idx, item) in values.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();

            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(item) = map.get(key) {
                    write_canonical(item, out);
                }
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_sorted_recursively() {
        let value = serde_json::json!({
            "b": 1,
            "a": {
                "d": 4,
                "c": 3
            }
        });

        assert_eq!(canonical_json_string(&value), r#"{"a":{"c":3,"d":4},"b":1}"#);
    }

    #[test]
    fn array_order_is_preserved() {
        let value = serde_json::json!({"a":[{"b":2},{"a":1}]});
        assert_eq!(canonical_json_string(&value), r#"{"a":[{"b":2},{"a":1}]}"#);
    }

    #[test]
    fn string_values_are_escaped() {
        let value = serde_json::json!({"msg": "line\n\"quoted\""});
        assert_eq!(
            canonical_json_string(&value),
            r#"{"msg":"line\n\"quoted\""}"#
        );
    }

    #[test]
    fn key_order_does_not_change_the_hash() {
        let a = serde_json::json!({"x": 1, "y": [true, null]});
        let b = serde_json::json!({"y": [true, null], "x": 1});
        assert_eq!(hash_canonical_json(&a), hash_canonical_json(&b));
    }

    #[test]
    fn sha256_hex_is_lowercase_and_valid() {
        let h = sha256_hex(b"abc");
        assert!(is_sha256_hex(&h));
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
