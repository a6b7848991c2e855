//! Canonical JSON: object keys sorted by codepoint, no insignificant
//! whitespace, UTF-8 output. Keys are sorted explicitly so the encoding does
//! not depend on how `serde_json::Map` happens to be ordered.

use serde_json::Value;

/// Largest integer magnitude representable in strict canonical JSON.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_value(value, &mut out);
    out
}

pub fn to_canonical_string(value: &Value) -> String {
    // Only valid UTF-8 is ever written.
    String::from_utf8_lossy(&to_canonical_bytes(value)).into_owned()
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                let _ = serde_json::to_writer(&mut *out, key);
                out.push(b':');
                write_value(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Scalars serialise without whitespace; Vec<u8> writes cannot fail.
    let _ = serde_json::to_writer(&mut *out, value);
}

/// Check the stricter number rules of newer room versions: integers only, in
/// the range `[-(2^53)+1, (2^53)-1]`. Returns the JSON path of the first
/// offending value.
pub fn check_strict(value: &Value) -> Result<(), String> {
    check_strict_at(value, "$")
}

fn check_strict_at(value: &Value, path: &str) -> Result<(), String> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) => Ok(()),
            Some(i) => Err(format!("{path}: integer {i} out of range")),
            None => Err(format!("{path}: non-integer number {n}")),
        },
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(idx, item)| check_strict_at(item, &format!("{path}[{idx}]"))),
        Value::Object(map) => map
            .iter()
            .try_for_each(|(key, item)| check_strict_at(item, &format!("{path}.{key}"))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_nested_keys_without_whitespace() {
        let value = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        assert_eq!(to_canonical_string(&value), r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }

    #[test]
    fn leaves_unicode_unescaped() {
        let value = json!({"body": "日本語", "ctrl": "\n"});
        assert_eq!(to_canonical_string(&value), "{\"body\":\"日本語\",\"ctrl\":\"\\n\"}");
    }

    #[test]
    fn strict_rejects_floats_and_huge_ints() {
        assert!(check_strict(&json!({"ok": [1, -2, "3"]})).is_ok());
        let err = check_strict(&json!({"content": {"bad_val": 1.1}})).unwrap_err();
        assert!(err.contains("$.content.bad_val"));
        assert!(check_strict(&json!({"n": 9007199254740992_i64})).is_err());
    }
}
