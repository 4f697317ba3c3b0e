//! [`ListFilterAction`] and [`ListMapAction`]: derive lists from lists.
//!
//! Script syntax:
//! ```yaml
//! - action: list_filter
//!   args: {src: readings, where: "item.volts > 3.0", limit: 2, dst: high}
//! - action: list_map
//!   args: {src: "$high", expr: "item.channel", dst: channels}
//! ```
//!
//! The expressions see every script variable plus `item`, `index` and, for
//! mapping items, `item.<key>`.

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::expression;
use crate::value::{Value, ValueMap};
use async_trait::async_trait;
use tracing::debug;

/// Keeps the items of `src` for which `where` is truthy, stopping after
/// `limit` matches.
pub struct ListFilterAction {
    schema: Schema,
}

impl ListFilterAction {
    pub const NAME: &'static str = "list_filter";

    pub fn new() -> Self {
        Self {
            schema: common_schema().required("where"),
        }
    }
}

impl Default for ListFilterAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ListFilterAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let items = source_list(ctx, &args)?;
        let filter = args.string("where")?;
        let limit = limit(&args)?;
        let base = ctx.vars_snapshot();

        let mut out = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            if out.len() >= limit {
                break;
            }
            if expression::evaluate(&filter, &item_scope(&base, &item, index))?.is_truthy() {
                out.push(item);
            }
        }
        debug!(kept = out.len(), "Filtered list");
        store(ctx, &args, out)
    }
}

/// Evaluates `expr` for each item of `src`, optionally skipping items for
/// which `where` is falsy, and collects up to `limit` results.
pub struct ListMapAction {
    schema: Schema,
}

impl ListMapAction {
    pub const NAME: &'static str = "list_map";

    pub fn new() -> Self {
        Self {
            schema: common_schema()
                .alias("map", "expr")
                .alias("value", "expr")
                .required("expr")
                .optional("where", Value::Null)
                .raw("expr")
                .typed("expr", TypeSpec::String),
        }
    }
}

impl Default for ListMapAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ListMapAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let items = source_list(ctx, &args)?;
        let expr = args.string("expr")?;
        let filter = args.opt_string("where")?;
        let limit = limit(&args)?;
        let base = ctx.vars_snapshot();

        let mut out = Vec::new();
        for (index, item) in items.iter().enumerate() {
            if out.len() >= limit {
                break;
            }
            let scope = item_scope(&base, item, index);
            if let Some(filter) = &filter {
                if !expression::evaluate(filter, &scope)?.is_truthy() {
                    continue;
                }
            }
            out.push(expression::evaluate(&expr, &scope)?);
        }
        debug!(mapped = out.len(), "Mapped list");
        store(ctx, &args, out)
    }
}

fn common_schema() -> Schema {
    Schema::new()
        .alias("items", "src")
        .alias("in", "src")
        .alias("when", "where")
        .alias("out", "dst")
        .required("src")
        .optional("limit", Value::Null)
        .optional("dst", Value::Null)
        .raw("src")
        .raw("where")
        .typed("where", TypeSpec::String)
        .typed("limit", TypeSpec::Integer)
        .typed("dst", TypeSpec::String)
}

/// `src` is a variable name, an expression or a literal list.
fn source_list(ctx: &RuntimeContext, args: &Args) -> Result<Vec<Value>> {
    let src = args.get("src").cloned().unwrap_or_default();
    let value = match &src {
        Value::Str(name) if !expression::is_expression(name) && ctx.var(name).is_some() => {
            ctx.var(name).cloned().unwrap_or_default()
        }
        other => ctx.eval_value(other)?,
    };
    match value {
        Value::List(items) => Ok(items),
        other => Err(Error::invalid(
            "src",
            format!("must be a list, got {}", other.type_name()),
        )),
    }
}

fn limit(args: &Args) -> Result<usize> {
    match args.opt_int("limit")? {
        None => Ok(usize::MAX),
        Some(n) => usize::try_from(n).map_err(|_| Error::invalid("limit", "must not be negative")),
    }
}

fn item_scope(base: &ValueMap, item: &Value, index: usize) -> ValueMap {
    let mut scope = base.clone();
    if let Value::Map(fields) = item {
        for (key, value) in fields {
            scope.insert(format!("item.{}", key), value.clone());
        }
    }
    scope.insert("item".into(), item.clone());
    scope.insert("index".into(), Value::from(index));
    scope
}

fn store(ctx: &mut RuntimeContext, args: &Args, out: Vec<Value>) -> Result<Value> {
    let out = Value::List(out);
    if let Some(dst) = args.opt_string("dst")? {
        ctx.set_var(dst, out.clone());
    }
    Ok(out)
}
