//! The [`Action`] trait, argument [`Schema`] validation and the
//! [`ActionRegistry`] the executor dispatches through.

use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::expression;
use crate::script::{ActionCall, Script, parse_duration};
use crate::value::{Value, ValueKind, ValueMap};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Set of runtime types an argument may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSpec {
    /// Int or float
    Number,
    Integer,
    String,
    Bool,
    Bytes,
    Mapping,
    List,
    /// Milliseconds as a number, or a duration string like `1.5s`
    Duration,
    OneOf(&'static [ValueKind]),
}

impl TypeSpec {
    fn kinds(self) -> &'static [ValueKind] {
        match self {
            TypeSpec::Number => &[ValueKind::Int, ValueKind::Float],
            TypeSpec::Integer => &[ValueKind::Int],
            TypeSpec::String => &[ValueKind::Str],
            TypeSpec::Bool => &[ValueKind::Bool],
            TypeSpec::Bytes => &[ValueKind::Bytes, ValueKind::Str],
            TypeSpec::Mapping => &[ValueKind::Map],
            TypeSpec::List => &[ValueKind::List],
            TypeSpec::Duration => &[ValueKind::Int, ValueKind::Float, ValueKind::Str],
            TypeSpec::OneOf(kinds) => kinds,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        self.kinds().contains(&value.kind())
    }

    fn describe(self) -> String {
        self.kinds()
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Immutable description of the arguments an action takes.
///
/// Built once per action with the chained constructors:
///
/// ```
/// use devscript::action::{Schema, TypeSpec};
///
/// let schema = Schema::new()
///     .alias("msg", "message")
///     .optional("message", "")
///     .typed("message", TypeSpec::String);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Schema {
    aliases: Vec<(&'static str, &'static str)>,
    required: Vec<&'static str>,
    optional: Vec<(&'static str, Value)>,
    types: Vec<(&'static str, TypeSpec)>,
    raw: Vec<&'static str>,
    allow_extra: bool,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `alt` as another spelling of `canonical`.
    pub fn alias(mut self, alt: &'static str, canonical: &'static str) -> Self {
        self.aliases.push((alt, canonical));
        self
    }

    pub fn required(mut self, key: &'static str) -> Self {
        self.required.push(key);
        self
    }

    /// Declare an optional argument, filled with `default` when absent.
    pub fn optional(mut self, key: &'static str, default: impl Into<Value>) -> Self {
        self.optional.push((key, default.into()));
        self
    }

    pub fn typed(mut self, key: &'static str, spec: TypeSpec) -> Self {
        self.types.push((key, spec));
        self
    }

    /// Hand this argument to the action without evaluating `$` expressions
    /// in it first.
    pub fn raw(mut self, key: &'static str) -> Self {
        self.raw.push(key);
        self
    }

    pub fn allow_extra(mut self) -> Self {
        self.allow_extra = true;
        self
    }

    fn is_known(&self, key: &str) -> bool {
        self.required.iter().any(|k| *k == key) || self.optional.iter().any(|(k, _)| *k == key)
    }

    /// Normalize and check `args` for `action`.
    ///
    /// Aliases are applied first, then defaults, then the required,
    /// unknown-key and type checks in that order. A string holding a `$`
    /// expression passes the type check here; its evaluated value is checked
    /// again by [`check_types`](Self::check_types).
    ///
    /// # Errors
    ///
    /// [`Error::MissingArgument`], [`Error::UnknownArgument`] or
    /// [`Error::TypeMismatch`], each naming the action and the argument.
    pub fn validate(&self, action: &str, args: &ValueMap) -> Result<Args> {
        let mut map = args.clone();

        for (alt, canonical) in &self.aliases {
            if !map.contains_key(*canonical) {
                if let Some(v) = map.remove(*alt) {
                    map.insert(canonical.to_string(), v);
                }
            }
        }

        for (key, default) in &self.optional {
            map.entry(key.to_string()).or_insert_with(|| default.clone());
        }

        if let Some(missing) = self.required.iter().find(|k| !map.contains_key(**k)) {
            return Err(Error::MissingArgument {
                action: action.to_string(),
                arg: missing.to_string(),
            });
        }

        if !self.allow_extra {
            let unknown: Vec<&str> = map
                .keys()
                .map(String::as_str)
                .filter(|k| !self.is_known(k))
                .collect();
            if !unknown.is_empty() {
                return Err(Error::UnknownArgument {
                    action: action.to_string(),
                    args: unknown.join(", "),
                });
            }
        }

        let args = Args {
            action: action.to_string(),
            map,
        };
        self.check(&args, true)?;
        Ok(args)
    }

    /// Re-run the type checks after expressions were evaluated.
    pub fn check_types(&self, args: &Args) -> Result<()> {
        self.check(args, false)
    }

    fn check(&self, args: &Args, defer_expressions: bool) -> Result<()> {
        for (key, spec) in &self.types {
            let Some(value) = args.get(key) else {
                continue;
            };
            if spec.accepts(value) {
                continue;
            }
            if defer_expressions && value.as_str().is_some_and(expression::is_expression) {
                continue;
            }
            return Err(Error::TypeMismatch {
                action: args.action.clone(),
                arg: key.to_string(),
                expected: spec.describe(),
                found: value.type_name(),
            });
        }
        Ok(())
    }

    pub(crate) fn is_raw(&self, key: &str) -> bool {
        self.raw.iter().any(|k| *k == key)
    }
}

/// Validated arguments of one action invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    action: String,
    map: ValueMap,
}

impl Args {
    /// The argument, or `None` if absent or null.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.map.iter()
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value)> {
        self.map.iter_mut()
    }

    pub fn into_map(self) -> ValueMap {
        self.map
    }

    fn missing(&self, key: &str) -> Error {
        Error::MissingArgument {
            action: self.action.clone(),
            arg: key.to_string(),
        }
    }

    fn mismatch(&self, key: &str, expected: &str, found: &Value) -> Error {
        Error::TypeMismatch {
            action: self.action.clone(),
            arg: key.to_string(),
            expected: expected.to_string(),
            found: found.type_name(),
        }
    }

    fn require(&self, key: &str) -> Result<&Value> {
        self.get(key).ok_or_else(|| self.missing(key))
    }

    /// Text form of a scalar argument.
    pub fn string(&self, key: &str) -> Result<String> {
        let value = self.require(key)?;
        match value {
            Value::Str(s) => Ok(s.clone()),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(value.to_string()),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            other => Err(self.mismatch(key, "string", other)),
        }
    }

    pub fn opt_string(&self, key: &str) -> Result<Option<String>> {
        if self.contains(key) {
            self.string(key).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn int(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        value
            .as_i64()
            .ok_or_else(|| self.mismatch(key, "integer", value))
    }

    pub fn opt_int(&self, key: &str) -> Result<Option<i64>> {
        if self.contains(key) {
            self.int(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Integer argument checked against `range`.
    pub fn int_in<T>(&self, key: &str, range: std::ops::RangeInclusive<i64>) -> Result<T>
    where
        T: TryFrom<i64>,
    {
        let n = self.int(key)?;
        if !range.contains(&n) {
            return Err(Error::invalid(
                key,
                format!("{} is outside {}..={}", n, range.start(), range.end()),
            ));
        }
        T::try_from(n).map_err(|_| Error::invalid(key, format!("{} does not fit", n)))
    }

    pub fn bool(&self, key: &str) -> Result<bool> {
        match self.require(key)? {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            other => Err(self.mismatch(key, "bool", other)),
        }
    }

    /// Numbers are milliseconds; strings may also carry an `ms` or `s` suffix.
    pub fn duration(&self, key: &str) -> Result<Duration> {
        let value = self.require(key)?;
        match value {
            Value::Int(ms) if *ms >= 0 => Ok(Duration::from_millis(*ms as u64)),
            Value::Float(ms) if *ms >= 0.0 && ms.is_finite() => {
                Ok(Duration::from_secs_f64(ms / 1000.0))
            }
            Value::Str(s) => match s.trim().parse::<f64>() {
                Ok(ms) if ms >= 0.0 && ms.is_finite() => Ok(Duration::from_secs_f64(ms / 1000.0)),
                _ => parse_duration(s),
            },
            Value::Int(_) | Value::Float(_) => {
                Err(Error::invalid(key, "duration must not be negative"))
            }
            other => Err(self.mismatch(key, "duration", other)),
        }
    }

    /// Raw bytes; strings are taken as UTF-8 text.
    pub fn bytes(&self, key: &str) -> Result<Vec<u8>> {
        let value = self.require(key)?;
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Str(s) => Ok(s.as_bytes().to_vec()),
            other => Err(self.mismatch(key, "bytes", other)),
        }
    }

    /// Mapping argument; an absent or null mapping is empty.
    pub fn map(&self, key: &str) -> Result<ValueMap> {
        match self.get(key) {
            None => Ok(ValueMap::new()),
            Some(Value::Map(m)) => Ok(m.clone()),
            Some(other) => Err(self.mismatch(key, "mapping", other)),
        }
    }

    /// List argument; an absent or null list is empty.
    pub fn list(&self, key: &str) -> Result<Vec<Value>> {
        match self.get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => Ok(items.clone()),
            Some(other) => Err(self.mismatch(key, "list", other)),
        }
    }
}

/// A named operation a script can invoke from a state's `do` list.
///
/// To add an action:
///
/// 1. Define `pub const NAME: &'static str` and build the [`Schema`] in the
///    constructor.
/// 2. Re-export the struct from `src/actions/mod.rs`.
/// 3. Register it in [`ActionRegistry::builtin`].
///
/// Arguments arrive validated against the schema, with `$` expressions
/// already evaluated except for keys the schema marks [`raw`](Schema::raw).
#[async_trait]
pub trait Action: Send + Sync {
    /// The script keyword. Implementations return their `NAME` constant.
    fn name(&self) -> &'static str;

    fn schema(&self) -> &Schema;

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value>;
}

/// Name-keyed table of actions. Built once before a run and never mutated
/// while one is in progress.
pub struct ActionRegistry {
    actions: HashMap<&'static str, Box<dyn Action>>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Every action this crate ships.
    pub fn builtin() -> Self {
        use crate::actions::*;

        let mut registry = Self::empty();
        registry.register(SetAction::new());
        registry.register(LogAction::new());
        registry.register(WaitAction::new());
        registry.register(WaitForEventAction::new());
        registry.register(SendTextAction::new());
        registry.register(ReadLineAction::new());
        registry.register(ReadStreamAction::new());
        registry.register(IfAction::new());
        registry.register(UseChannelAction::new());
        registry.register(AtCommandAction::new());
        registry.register(ScpiCommandAction::new());
        registry.register(ModbusAction::read());
        registry.register(ModbusAction::write());
        registry.register(SendXmodemBlockAction::new());
        registry.register(SendEotAction::new());
        registry.register(FileTransferAction::xmodem());
        registry.register(FileTransferAction::ymodem());
        registry.register(SendFrameAction::new());
        registry.register(ExpectFrameAction::new());
        registry.register(ListFilterAction::new());
        registry.register(ListMapAction::new());
        registry.register(RecordStartAction::new());
        registry.register(RecordStopAction::new());
        registry
    }

    /// Add `action`, replacing any action with the same name.
    pub fn register(&mut self, action: impl Action + 'static) {
        self.actions.insert(action.name(), Box::new(action));
    }

    pub fn get(&self, name: &str) -> Result<&dyn Action> {
        self.actions
            .get(name)
            .map(|a| a.as_ref())
            .ok_or_else(|| Error::UnknownAction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.actions.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Check that every action `script` names, including the branches of
    /// `if` actions, is registered.
    pub fn check_script(&self, script: &Script) -> Result<()> {
        for state in script.state_machine.states.values() {
            for call in &state.actions {
                self.check_call(call)?;
            }
        }
        Ok(())
    }

    fn check_call(&self, call: &ActionCall) -> Result<()> {
        self.get(&call.name)?;
        for branch in call.branches()? {
            self.check_call(&branch)?;
        }
        Ok(())
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Validate `call`, evaluate its expression arguments and run it.
pub async fn dispatch(ctx: &mut RuntimeContext, call: &ActionCall) -> Result<Value> {
    let registry = Arc::clone(ctx.registry());
    let action = registry.get(&call.name)?;
    let schema = action.schema();
    let mut args = schema.validate(&call.name, &call.args)?;
    for (key, value) in args.values_mut() {
        if !schema.is_raw(key) {
            ctx.resolve(value)?;
        }
    }
    schema.check_types(&args)?;
    debug!(action = %call.name, "Dispatching action");
    action.execute(ctx, args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn schema() -> Schema {
        Schema::new()
            .alias("cmd", "command")
            .required("command")
            .optional("timeout", 1000)
            .optional("tags", Vec::<Value>::new())
            .typed("timeout", TypeSpec::Number)
            .typed("tags", TypeSpec::List)
    }

    #[test]
    fn test_alias_and_defaults() {
        let args = schema()
            .validate("probe", &value_map! { "cmd" => "AT" })
            .unwrap();
        assert_eq!(args.string("command").unwrap(), "AT");
        assert_eq!(args.int("timeout").unwrap(), 1000);
        assert!(args.get("cmd").is_none());
    }

    #[test]
    fn test_canonical_wins_over_alias() {
        let args = schema()
            .validate("probe", &value_map! { "command" => "A", "cmd" => "B" })
            .unwrap_err();
        assert!(matches!(args, Error::UnknownArgument { ref args, .. } if args == "cmd"));
    }

    #[test]
    fn test_missing_required() {
        let err = schema().validate("probe", &ValueMap::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingArgument { ref action, ref arg } if action == "probe" && arg == "command"
        ));
    }

    #[test]
    fn test_unknown_argument() {
        let err = schema()
            .validate("probe", &value_map! { "command" => "x", "colour" => "red" })
            .unwrap_err();
        assert!(matches!(err, Error::UnknownArgument { ref args, .. } if args == "colour"));

        let lenient = Schema::new().allow_extra();
        assert!(lenient.validate("set", &value_map! { "anything" => 1 }).is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        let err = schema()
            .validate("probe", &value_map! { "command" => "x", "timeout" => "soon" })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch { ref arg, found: "string", .. } if arg == "timeout"
        ));
        // Null is treated as absent.
        assert!(schema()
            .validate("probe", &value_map! { "command" => "x", "timeout" => Value::Null })
            .is_ok());
    }

    #[test]
    fn test_expression_strings_are_deferred() {
        let args = schema()
            .validate("probe", &value_map! { "command" => "x", "timeout" => "$t * 2" })
            .unwrap();
        assert!(schema().check_types(&args).is_err());
    }

    #[test]
    fn test_defaults_are_not_shared() {
        let s = schema();
        let mut first = s.validate("probe", &value_map! { "command" => "x" }).unwrap();
        for (key, value) in first.values_mut() {
            if key == "tags" {
                *value = Value::List(vec![Value::Int(1)]);
            }
        }
        let second = s.validate("probe", &value_map! { "command" => "x" }).unwrap();
        assert!(second.list("tags").unwrap().is_empty());
    }

    #[test]
    fn test_duration_getter() {
        let args = Schema::new()
            .allow_extra()
            .validate(
                "t",
                &value_map! { "a" => 250, "b" => "1.5s", "c" => "40", "d" => -1 },
            )
            .unwrap();
        assert_eq!(args.duration("a").unwrap(), Duration::from_millis(250));
        assert_eq!(args.duration("b").unwrap(), Duration::from_millis(1500));
        assert_eq!(args.duration("c").unwrap(), Duration::from_millis(40));
        assert!(args.duration("d").is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ActionRegistry::builtin();
        assert!(registry.get("modbus_read").is_ok());
        assert!(registry.contains("if"));
        assert!(matches!(
            registry.get("teleport"),
            Err(Error::UnknownAction(ref n)) if n == "teleport"
        ));
    }
}
