//! Canonical JSON encoding and SHA-256 helpers.
//!
//! Every hash in the protocol (bundle hashes, log event hashes, payload
//! hashes, evidence hashes) is computed over the byte output of
//! [`canonical_json`]. The encoding is byte-compatible with the
//! `sort_keys=True, separators=(",", ":")` form used by off-chain Python
//! tooling:
//!
//! - object keys are emitted in ascending code-point order,
//! - no insignificant whitespace,
//! - all output is ASCII; anything outside `0x20..=0x7e` is written as a
//!   lowercase `\uXXXX` escape (surrogate pairs above the BMP),
//! - floats use the shortest round-trip representation with Python `repr`
//!   exponent rules (`1e-05`, `1e+16`, `0.5`, `2.0`).

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

/// Serializes any `Serialize` value into canonical JSON.
///
/// Values that cannot be represented as JSON (non-string map keys,
/// non-finite floats) surface as `serde_json::Error`.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_json_value(&value))
}

/// Serializes an already-built [`Value`] into canonical JSON.
pub fn canonical_json_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256_bytes(bytes))
}

/// Raw SHA-256 digest of `bytes`.
pub fn sha256_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// SHA-256 hex over the canonical JSON of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key]);
            }
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &Number) {
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(f) = n.as_f64() {
        out.push_str(&format_float(f));
    } else {
        out.push_str(&n.to_string());
    }
}

/// Formats a finite float the way Python's `repr(float)` does.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }

    // `{:e}` yields the shortest round-trip digits, e.g. "-1.25e-7".
    let sci = format!("{:e}", f);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    let (negative, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    let mut out = String::new();
    if negative {
        out.push('-');
    }

    if (-4..16).contains(&exp) {
        if exp >= 0 {
            let int_len = (exp + 1) as usize;
            if digits.len() <= int_len {
                out.push_str(&digits);
                out.extend(std::iter::repeat_n('0', int_len - digits.len()));
                out.push_str(".0");
            } else {
                out.push_str(&digits[..int_len]);
                out.push('.');
                out.push_str(&digits[int_len..]);
            }
        } else {
            out.push_str("0.");
            out.extend(std::iter::repeat_n('0', (-exp - 1) as usize));
            out.push_str(&digits);
        }
    } else {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('e');
        out.push(if exp < 0 { '-' } else { '+' });
        out.push_str(&format!("{:02}", exp.abs()));
    }
    out
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let v = json!({"b": 1, "a": [1, 2, {"d": null, "c": true}]});
        assert_eq!(
            canonical_json_value(&v),
            r#"{"a":[1,2,{"c":true,"d":null}],"b":1}"#
        );
    }

    #[test]
    fn non_ascii_is_escaped_lowercase() {
        let v = json!({"k": "caf\u{e9} \u{1F600}\u{7f}"});
        assert_eq!(
            canonical_json_value(&v),
            r#"{"k":"caf\u00e9 \ud83d\ude00\u007f"}"#
        );
    }

    #[test]
    fn control_characters_use_short_escapes() {
        let v = json!("a\"b\\c\nd\te\u{01}");
        assert_eq!(canonical_json_value(&v), r#""a\"b\\c\nd\te\u0001""#);
    }

    #[test]
    fn floats_follow_python_repr() {
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(2.0), "2.0");
        assert_eq!(format_float(-0.0), "-0.0");
        assert_eq!(format_float(0.0001), "0.0001");
        assert_eq!(format_float(0.00001), "1e-05");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(123456789012345.6), "123456789012345.6");
        assert_eq!(format_float(0.1 + 0.2), "0.30000000000000004");
    }

    #[test]
    fn integers_are_not_decorated() {
        let v = json!({"n": -7, "m": 18446744073709551615u64, "f": 1.0});
        assert_eq!(
            canonical_json_value(&v),
            r#"{"f":1.0,"m":18446744073709551615,"n":-7}"#
        );
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
