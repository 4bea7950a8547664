//! `$token` parameter substitution.
//!
//! Tokens are `$name` (identifier) or `$1..$N` (numbered capture). A token
//! with no matching parameter is left in place, so unresolved inputs stay
//! visible instead of silently collapsing to the empty string.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*|[0-9]+)").expect("token pattern is valid")
});

/// Replace `$token` occurrences in `input` with values from `params`.
#[must_use]
pub fn substitute(input: &str, params: &HashMap<String, String>) -> String {
    TOKEN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            params
                .get(key)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Rewrite string values of a free-form config map in place.
///
/// Strings directly held by a map are substituted; nested maps and maps
/// inside arrays are rewritten recursively. Other value kinds pass
/// through untouched.
pub fn substitute_value(value: &mut Value, params: &HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for entry in map.values_mut() {
                match entry {
                    Value::String(s) => *s = substitute(s, params),
                    Value::Object(_) => substitute_value(entry, params),
                    Value::Array(items) => {
                        for item in items.iter_mut() {
                            if item.is_object() {
                                substitute_value(item, params);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                if item.is_object() {
                    substitute_value(item, params);
                }
            }
        }
        _ => {}
    }
}
