//! Restricted expression language used by `when` conditions, `set` values
//! and `log` messages.
//!
//! The grammar covers literals, `$name` references (dots are part of the
//! name, so `$file.size` is one identifier), arithmetic, bitwise `&`/`|`,
//! chained comparisons, `and`/`or`/`not`, the `a if cond else b` ternary,
//! attribute access and subscripts. Anything else is rejected with
//! [`Error::UnsupportedExpression`] before a single sub-expression runs.
//!
//! ```
//! use devscript::expression::evaluate;
//! use devscript::{Value, value_map};
//!
//! let vars = value_map! { "a" => 2, "b" => 3 };
//! assert_eq!(evaluate("$a + $b", &vars).unwrap(), Value::Int(5));
//! ```

mod eval;
mod parser;

use crate::error::{Error, Result};
use crate::value::{Value, ValueMap};
use eval::Evaluator;

/// Parse and evaluate `expr` against `vars`.
///
/// `now` is injected as the current wall-clock time in milliseconds and
/// shadows any variable of the same name.
pub fn evaluate(expr: &str, vars: &ValueMap) -> Result<Value> {
    evaluate_at(expr, vars, chrono::Utc::now().timestamp_millis())
}

/// Like [`evaluate`] with a fixed value for `now`.
pub fn evaluate_at(expr: &str, vars: &ValueMap, now: i64) -> Result<Value> {
    let ast = parser::parse(expr)?;
    Evaluator {
        source: expr,
        vars,
        now,
    }
    .eval(&ast)
}

/// Whether `text` references a variable and should be evaluated rather
/// than taken literally.
pub fn is_expression(text: &str) -> bool {
    text.contains('$')
}

/// Substitute `${expr}` and `$name` occurrences in `template` with the
/// display form of their values. `$$` produces a literal `$`.
pub fn interpolate(template: &str, vars: &ValueMap) -> Result<String> {
    let now = chrono::Utc::now().timestamp_millis();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or_else(|| Error::UnsupportedExpression {
                expr: template.to_string(),
                reason: "unterminated '${'".into(),
            })?;
            let value = evaluate_at(&body[..end], vars, now)?;
            out.push_str(&value.to_string());
            rest = &body[end + 1..];
        } else {
            let len = after
                .char_indices()
                .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '.'))
                .map(|(i, _)| i)
                .unwrap_or(after.len());
            // A trailing dot ends a sentence, not a path.
            let name = after[..len].trim_end_matches('.');
            if name.is_empty() {
                out.push('$');
                rest = after;
                continue;
            }
            let value = evaluate_at(&format!("${}", name), vars, now)?;
            out.push_str(&value.to_string());
            rest = &after[name.len()..];
        }
    }
    out.push_str(rest);
    Ok(out)
}
