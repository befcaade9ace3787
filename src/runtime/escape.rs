// src/runtime/escape.rs
//! HTML escaping for `AppendEscaped` output
//!
//! The four standard entities plus hex entities for backtick and apostrophe,
//! matching the source engine's wire-compatible choice. SafeString values
//! bypass escaping; non-scalar values reaching escaped output are a fatal
//! render error.

use crate::runtime::value::Value;
use crate::runtime::resolve_lambda;
use crate::RenderError;

/// Escape a rendered string.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            _ => out.push(c),
        }
    }
    out
}

/// Produce the escaped output for a value: SafeString passes through,
/// callables are resolved against the current context first, scalars are
/// stringified then escaped, and anything else is fatal.
pub fn escape_expression(value: &Value, context: &Value) -> Result<String, RenderError> {
    match value {
        Value::SafeString(s) => Ok(s.clone()),
        Value::Lambda(_) => {
            let resolved = resolve_lambda(value.clone(), context)?;
            match resolved {
                // A lambda resolving to another lambda is not rendered.
                Value::Lambda(_) => Err(RenderError::NonScalarOutput),
                other => escape_expression(&other, context),
            }
        }
        Value::Array(_) | Value::Object(_) => Err(RenderError::NonScalarOutput),
        scalar => Ok(escape_html(&scalar.render(false))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Lambda;

    #[test]
    fn test_escape_entities() {
        assert_eq!(
            escape_html(r#"&<>"'`"#),
            "&amp;&lt;&gt;&quot;&#x27;&#x60;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_safe_string_bypasses() {
        let v = Value::SafeString("<b>bold</b>".to_string());
        assert_eq!(
            escape_expression(&v, &Value::Null).unwrap(),
            "<b>bold</b>"
        );
    }

    #[test]
    fn test_scalars_escape() {
        let v = Value::from("A&B");
        assert_eq!(escape_expression(&v, &Value::Null).unwrap(), "A&amp;B");
        assert_eq!(
            escape_expression(&Value::Int(7), &Value::Null).unwrap(),
            "7"
        );
        assert_eq!(escape_expression(&Value::Null, &Value::Null).unwrap(), "");
    }

    #[test]
    fn test_non_scalar_is_fatal() {
        let v = Value::Array(vec![Value::Int(1)]);
        assert!(matches!(
            escape_expression(&v, &Value::Null),
            Err(RenderError::NonScalarOutput)
        ));
    }

    #[test]
    fn test_lambda_resolves_before_escaping() {
        let v = Value::Lambda(Lambda::new(|_| Ok(Value::from("a<b"))));
        assert_eq!(escape_expression(&v, &Value::Null).unwrap(), "a&lt;b");
    }
}
