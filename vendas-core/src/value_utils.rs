//! Value utility functions shared across modules
//!
//! Dot-path access into JSON documents, field references (`"$compras.nome_produto"`)
//! and the value ordering used by `$sort` and `$min`/`$max`.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Strip the leading `$` of a field reference
///
/// Returns `None` when the string is not a field reference.
///
/// ```
/// use vendas_core::value_utils::field_path;
///
/// assert_eq!(field_path("$compras.nome_produto"), Some("compras.nome_produto"));
/// assert_eq!(field_path("compras"), None);
/// ```
pub fn field_path(reference: &str) -> Option<&str> {
    match reference.strip_prefix('$') {
        Some(path) if !path.is_empty() && !path.starts_with('$') => Some(path),
        _ => None,
    }
}

/// Get nested value from JSON with dot notation support
///
/// Supports plain fields (`"cliente"`), nested objects (`"compras.nome_produto"`
/// after an unwind) and array positions (`"compras.0.nome_produto"`).
///
/// ```
/// use serde_json::json;
/// use vendas_core::value_utils::get_nested_value;
///
/// let row = json!({"compras": {"nome_produto": "Caneta"}});
/// assert_eq!(get_nested_value(&row, "compras.nome_produto"), Some(&json!("Caneta")));
/// ```
pub fn get_nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }

    let mut value = doc;
    for part in path.split('.') {
        match value {
            Value::Object(map) => value = map.get(part)?,
            Value::Array(arr) => value = arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(value)
}

/// Set a value at a nested path, creating intermediate objects as needed
///
/// Used by `$unwind` to put the unwound element back at its path. Writing
/// through a non-object leaves the document unchanged.
pub fn set_nested_value(doc: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;

    while let Some(part) = parts.next() {
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove the value at a nested path, returning it
pub fn remove_nested_value(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.remove(path),
        Some((parent, last)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.as_object_mut()?.get_mut(part)?;
            }
            current.as_object_mut()?.remove(last)
        }
    }
}

/// Name of a value's JSON type, for error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compare two JSON values of the same kind
///
/// Numbers compare as f64, strings lexicographically, booleans `false < true`.
/// Values of different kinds are incomparable.
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use vendas_core::value_utils::compare_values;
///
/// assert_eq!(compare_values(&json!("Borracha"), &json!("Caneta")), Some(Ordering::Less));
/// assert_eq!(compare_values(&json!("Caneta"), &json!(3)), None);
/// ```
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => n1.as_f64()?.partial_cmp(&n2.as_f64()?),
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Ordering used by `$sort`: missing and null values first, incomparable values equal
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(av), Some(bv)) => compare_values(av, bv).unwrap_or(Ordering::Equal),
    }
}

/// Canonical string form of a value with object keys sorted
///
/// Two documents that only differ in key order map to the same string, which
/// makes it usable as a `$group` key and for `$addToSet` deduplication.
pub fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));

            let inner = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::from(k.as_str()), canonical_json_string(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", inner)
        }
        Value::Array(arr) => {
            let inner = arr
                .iter()
                .map(canonical_json_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", inner)
        }
        _ => value.to_string(),
    }
}
