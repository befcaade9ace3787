// src/runtime/partial.rs
//! Partial resolution and invocation plumbing shared by both backends

use crate::runtime::registry::Partial;
use crate::runtime::value::{Value, ValueMap};
use crate::runtime::RenderContext;
use crate::RenderError;

/// Resolve a partial by name: inline-partial scopes shadow render-time
/// overrides, which shadow the engine registry.
pub fn resolve_partial(rcx: &RenderContext, name: &str) -> Result<Partial, RenderError> {
    rcx.lookup_partial(name)
        .ok_or_else(|| RenderError::PartialMissing(name.to_string()))
}

/// A dynamic partial expression must evaluate to a name.
pub fn partial_name_from_value(value: &Value) -> Result<String, RenderError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RenderError::InvalidPartialName("partial name is not a string".into()))
}

/// The context a partial body runs against: the explicit (or inherited)
/// context param, with hash arguments merged over it when present.
pub fn partial_context(param: &Value, hash: Option<&ValueMap>) -> Value {
    match hash {
        None => param.clone(),
        Some(hash) => {
            let mut map = match param {
                Value::Object(m) => m.clone(),
                _ => ValueMap::new(),
            };
            for (k, v) in hash {
                map.insert(k.clone(), v.clone());
            }
            Value::Object(map)
        }
    }
}

/// Prefix each output line with the partial's indent string. An empty
/// trailing line — the tail of output ending in a newline — is not indented.
pub fn indent_lines(output: &str, indent: &str) -> String {
    if indent.is_empty() || output.is_empty() {
        return output.to_string();
    }
    let lines: Vec<&str> = output.split('\n').collect();
    let count = lines.len();
    let mut out = String::with_capacity(output.len() + indent.len() * count);
    for (i, line) in lines.iter().enumerate() {
        let last = i + 1 == count;
        if !(line.is_empty() && last) {
            out.push_str(indent);
            out.push_str(line);
        }
        if !last {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indent_basic() {
        assert_eq!(indent_lines("a\nb", "  "), "  a\n  b");
    }

    #[test]
    fn test_indent_skips_trailing_empty_line() {
        assert_eq!(indent_lines("a\nb\n", "  "), "  a\n  b\n");
    }

    #[test]
    fn test_indent_noop_cases() {
        assert_eq!(indent_lines("", "  "), "");
        assert_eq!(indent_lines("a", ""), "a");
    }

    #[test]
    fn test_partial_context_merges_hash() {
        let param: Value = serde_json::json!({"a": 1, "b": 2}).into();
        let mut hash = ValueMap::new();
        hash.insert("b".to_string(), Value::Int(9));

        let merged = partial_context(&param, Some(&hash));
        assert_eq!(merged.get("a"), Some(&Value::Int(1)));
        assert_eq!(merged.get("b"), Some(&Value::Int(9)));

        // without a hash the param passes through untouched
        assert_eq!(partial_context(&param, None), param);
        // hash over a non-object context keeps only the hash
        let merged = partial_context(&Value::Null, Some(&hash));
        assert_eq!(merged.get("b"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_dynamic_name_must_be_string() {
        assert_eq!(
            partial_name_from_value(&Value::from("p")).unwrap(),
            "p"
        );
        assert!(matches!(
            partial_name_from_value(&Value::Int(3)),
            Err(RenderError::InvalidPartialName(_))
        ));
    }
}
