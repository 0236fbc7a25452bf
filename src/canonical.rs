//! Canonical JSON: byte-stable rendering used everywhere a hash is derived.
//!
//! Object keys are sorted lexicographically, integral floats are rendered as
//! integers, and non-finite numbers are rejected. Two payloads that are equal
//! as JSON values always canonicalize to the same UTF-8 bytes regardless of
//! map iteration order or how the numbers were originally written.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("non-finite number cannot be canonicalized")]
    NonFiniteNumber,

    #[error("serializing value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Render a serializable value as canonical JSON.
pub fn canonical_json<T: serde::Serialize>(value: &T) -> Result<String, CanonicalError> {
    let v = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

fn write_value(v: &Value, out: &mut String) -> Result<(), CanonicalError> {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(n: &serde_json::Number, out: &mut String) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n.as_f64().ok_or(CanonicalError::NonFiniteNumber)?;
    if !f.is_finite() {
        return Err(CanonicalError::NonFiniteNumber);
    }
    // Integral floats normalize to their integer rendering so 40.0 and 40
    // hash identically.
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        out.push_str(&(f as i64).to_string());
        return Ok(());
    }
    out.push_str(&f.to_string());
    Ok(())
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let v = json!({ "b": 1, "a": 2, "c": { "z": 0, "y": 1 } });
        assert_eq!(
            canonical_json(&v).unwrap(),
            r#"{"a":2,"b":1,"c":{"y":1,"z":0}}"#
        );
    }

    #[test]
    fn normalizes_integral_floats() {
        let v = json!({ "rate": 40.0, "n": 7 });
        assert_eq!(canonical_json(&v).unwrap(), r#"{"n":7,"rate":40}"#);
    }

    #[test]
    fn escapes_control_characters() {
        let v = json!("a\nb\u{1}");
        assert_eq!(canonical_json(&v).unwrap(), "\"a\\nb\\u0001\"");
    }

    #[test]
    fn key_order_does_not_change_output() {
        let a = json!({ "x": [1, 2], "y": "s" });
        let b = json!({ "y": "s", "x": [1, 2] });
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }
}
