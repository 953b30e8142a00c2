//! `${name}` substitution in step parameters.
//!
//! Strings are scanned for placeholders and each resolved one is replaced by
//! the text of its value. A string that is exactly one placeholder takes the
//! resolved value itself, so `"${count}"` can stay a number. Unresolved
//! placeholders are left as written. Arrays and objects are walked
//! recursively; object keys are not touched.

use crate::value::render;
use serde_json::{Map, Value};

pub fn interpolate<F>(value: &Value, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    match value {
        Value::String(text) => interpolate_str(text, lookup),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, lookup)).collect()),
        Value::Object(map) => Value::Object(interpolate_map(map, lookup)),
        other => other.clone(),
    }
}

pub fn interpolate_map<F>(map: &Map<String, Value>, lookup: &F) -> Map<String, Value>
where
    F: Fn(&str) -> Option<Value>,
{
    map.iter()
        .map(|(k, v)| (k.clone(), interpolate(v, lookup)))
        .collect()
}

fn interpolate_str<F>(text: &str, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    if let Some(name) = whole_placeholder(text) {
        if let Some(value) = lookup(name) {
            return value;
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        match lookup(name) {
            Some(value) => out.push_str(&render(&value)),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains('}') && !inner.contains("${")).then(|| inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(name: &str) -> Option<Value> {
        match name {
            "version" => Some(json!("1.2.0")),
            "count" => Some(json!(3)),
            "steps.build.result" => Some(json!({"apk": "app.apk"})),
            _ => None,
        }
    }

    #[test]
    fn replaces_inside_text() {
        let out = interpolate(&json!("release-${version}-x${count}"), &vars);
        assert_eq!(out, json!("release-1.2.0-x3"));
    }

    #[test]
    fn whole_placeholder_keeps_the_type() {
        assert_eq!(interpolate(&json!("${count}"), &vars), json!(3));
        assert_eq!(
            interpolate(&json!("${steps.build.result}"), &vars),
            json!({"apk": "app.apk"})
        );
    }

    #[test]
    fn unknown_and_unclosed_placeholders_are_left_alone() {
        assert_eq!(interpolate(&json!("${nope}"), &vars), json!("${nope}"));
        assert_eq!(interpolate(&json!("a ${nope} b"), &vars), json!("a ${nope} b"));
        assert_eq!(interpolate(&json!("tail ${version"), &vars), json!("tail ${version"));
    }

    #[test]
    fn walks_nested_values() {
        let params = json!({
            "tags": ["v${version}", 7],
            "meta": {"n": "${count}"},
            "flag": true
        });
        let out = interpolate(&params, &vars);
        assert_eq!(out, json!({"tags": ["v1.2.0", 7], "meta": {"n": 3}, "flag": true}));
    }
}
