//! Script document model and YAML parser.
//!
//! The top-level entry points are [`parse_str`] and [`parse_file`]. A script
//! looks like this:
//!
//! ```yaml
//! version: 1
//! vars:
//!   retries: 0
//! channels:
//!   dut: {type: serial, device: /dev/ttyUSB0, baud: 115200}
//! state_machine:
//!   initial: probe
//!   states:
//!     probe:
//!       do:
//!         - action: at_command
//!           args: {cmd: AT, timeout: 500}
//!       goto: done
//!     done:
//!       do:
//!         - log: "finished after $retries retries"
//! ```
//!
//! Each `do` item is either `{action: name, args: {...}}` or one of the
//! shorthand forms `set`, `log`, `wait`, `wait_for_event` and `if`, which are
//! normalized to an [`ActionCall`] here.

use crate::channel::ChannelConfig;
use crate::error::{Error, Result};
use crate::value::{Value, ValueMap, yaml_key};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// A parsed script. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub version: u32,
    pub vars: ValueMap,
    /// Declared channels, in document order.
    pub channels: Vec<(String, ChannelConfig)>,
    pub state_machine: StateMachine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateMachine {
    pub initial: String,
    pub states: BTreeMap<String, State>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct State {
    pub name: String,
    pub actions: Vec<ActionCall>,
    pub on_event: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub on_timeout: Option<String>,
    pub when: Option<String>,
    pub goto: Option<String>,
    pub else_goto: Option<String>,
}

impl State {
    /// A state with nothing to wait for ends the run after its actions.
    pub fn is_terminal(&self) -> bool {
        self.goto.is_none() && self.on_event.is_empty() && self.timeout.is_none()
    }
}

/// One entry of a state's `do` list.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub name: String,
    pub args: ValueMap,
}

impl ActionCall {
    pub fn new(name: impl Into<String>, args: ValueMap) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Normalize one `do` item.
    pub fn from_item(item: &Value) -> Result<Self> {
        let map = item
            .as_map()
            .ok_or_else(|| Error::Script(format!("action item must be a mapping, got {}", item)))?;

        if let Some(name) = map.get("action") {
            let name = name
                .as_str()
                .ok_or_else(|| Error::Script(format!("action name must be a string, got {}", name)))?;
            if let Some(extra) = map.keys().find(|k| *k != "action" && *k != "args") {
                return Err(Error::Script(format!(
                    "action '{}': unexpected key '{}' beside 'args'",
                    name, extra
                )));
            }
            let args = match map.get("args") {
                None | Some(Value::Null) => ValueMap::new(),
                Some(Value::Map(args)) => args.clone(),
                Some(other) => {
                    return Err(Error::Script(format!(
                        "action '{}': args must be a mapping, got {}",
                        name, other
                    )));
                }
            };
            return Ok(Self::new(name, args));
        }

        let mut entries = map.iter();
        let (Some((key, body)), None) = (entries.next(), entries.next()) else {
            return Err(Error::Script(format!(
                "shorthand action item must have exactly one key: {}",
                item
            )));
        };
        let scalar_key = match key.as_str() {
            "set" | "if" => None,
            "log" => Some("message"),
            "wait" => Some("ms"),
            "wait_for_event" => Some("event"),
            other => return Err(Error::Script(format!("unknown action item '{}'", other))),
        };
        let args = match (body, scalar_key) {
            (Value::Map(args), _) => args.clone(),
            (scalar, Some(arg)) => ValueMap::from([(arg.to_string(), scalar.clone())]),
            (other, None) => {
                return Err(Error::Script(format!(
                    "'{}' needs a mapping, got {}",
                    key, other
                )));
            }
        };
        Ok(Self::new(key.as_str(), args))
    }

    /// The nested calls of an `if` action's `then` and `else` branches.
    pub fn branches(&self) -> Result<Vec<ActionCall>> {
        if self.name != "if" {
            return Ok(Vec::new());
        }
        let mut calls = Vec::new();
        for (key, alt) in [("then", "do"), ("else", "otherwise")] {
            let key = if self.args.contains_key(key) { key } else { alt };
            calls.extend(branch(&self.args, key)?);
        }
        Ok(calls)
    }
}

/// Parse the `key` branch of `if` arguments into calls.
pub(crate) fn branch(args: &ValueMap, key: &str) -> Result<Vec<ActionCall>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::List(items)) => items.iter().map(ActionCall::from_item).collect(),
        Some(item @ Value::Map(_)) => Ok(vec![ActionCall::from_item(item)?]),
        Some(other) => Err(Error::Script(format!(
            "if.{} must be a list of actions, got {}",
            key, other
        ))),
    }
}

#[derive(Deserialize)]
struct RawScript {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default, alias = "variables")]
    vars: serde_yaml::Mapping,
    #[serde(default)]
    channels: serde_yaml::Mapping,
    state_machine: RawStateMachine,
}

fn default_version() -> u32 {
    1
}

#[derive(Deserialize)]
struct RawStateMachine {
    initial: String,
    #[serde(default)]
    states: serde_yaml::Mapping,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawState {
    #[serde(default, rename = "do", alias = "actions")]
    actions: Vec<serde_yaml::Value>,
    #[serde(default)]
    on_event: serde_yaml::Mapping,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    timeout: Option<Duration>,
    #[serde(default)]
    on_timeout: Option<String>,
    #[serde(default)]
    when: Option<serde_yaml::Value>,
    #[serde(default)]
    goto: Option<String>,
    #[serde(default)]
    else_goto: Option<String>,
}

/// Parse a script from a YAML string.
///
/// # Errors
///
/// Returns [`Error::Yaml`] for malformed YAML and [`Error::Script`] for an
/// unknown `initial` state, a transition to an undeclared state or an
/// unrecognized `do` item.
///
/// # Example
///
/// ```
/// use devscript::parse_str;
///
/// let script = parse_str(r#"
/// state_machine:
///   initial: s1
///   states:
///     s1: {goto: s2}
///     s2: {do: [{log: done}]}
/// "#).unwrap();
/// assert_eq!(script.state_machine.initial, "s1");
/// ```
pub fn parse_str(content: &str) -> Result<Script> {
    let raw: RawScript = serde_yaml::from_str(content)?;

    let vars = raw
        .vars
        .into_iter()
        .map(|(k, v)| (yaml_key(k), Value::from(v)))
        .collect();

    let mut channels = Vec::with_capacity(raw.channels.len());
    for (name, config) in raw.channels {
        let name = yaml_key(name);
        let config: ChannelConfig = serde_yaml::from_value(config)
            .map_err(|e| Error::Script(format!("channel '{}': {}", name, e)))?;
        channels.push((name, config));
    }

    let mut states = BTreeMap::new();
    for (name, node) in raw.state_machine.states {
        let name = yaml_key(name);
        let state = parse_state(&name, node)?;
        states.insert(name, state);
    }

    let state_machine = StateMachine {
        initial: raw.state_machine.initial,
        states,
    };
    validate_targets(&state_machine)?;

    Ok(Script {
        version: raw.version,
        vars,
        channels,
        state_machine,
    })
}

/// Parse a script from a file.
///
/// # Errors
///
/// Returns [`Error::File`] if the file cannot be read, otherwise as
/// [`parse_str`].
pub fn parse_file(path: impl AsRef<Path>) -> Result<Script> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| Error::File {
        path: path.display().to_string(),
        source,
    })?;
    parse_str(&content)
}

fn parse_state(name: &str, node: serde_yaml::Value) -> Result<State> {
    // `s2: ~` declares a terminal state with no actions.
    let raw: RawState = if node.is_null() {
        serde_yaml::from_str("{}")?
    } else {
        serde_yaml::from_value(node).map_err(|e| Error::Script(format!("state '{}': {}", name, e)))?
    };

    let actions = raw
        .actions
        .into_iter()
        .map(|item| {
            let call = ActionCall::from_item(&Value::from(item))?;
            call.branches()?;
            Ok(call)
        })
        .collect::<Result<Vec<_>>>()
        .map_err(|e| match e {
            Error::Script(msg) => Error::Script(format!("state '{}': {}", name, msg)),
            other => other,
        })?;

    let on_event: BTreeMap<String, String> = raw
        .on_event
        .into_iter()
        .map(|(label, target)| {
            let target = match target {
                serde_yaml::Value::String(s) => s,
                other => {
                    return Err(Error::Script(format!(
                        "state '{}': on_event target must be a state name, got {:?}",
                        name, other
                    )));
                }
            };
            Ok((yaml_key(label), target))
        })
        .collect::<Result<_>>()?;

    let when = raw.when.map(|w| Value::from(w).to_string());

    Ok(State {
        name: name.to_string(),
        actions,
        on_event,
        timeout: raw.timeout,
        on_timeout: raw.on_timeout,
        when,
        goto: raw.goto,
        else_goto: raw.else_goto,
    })
}

fn validate_targets(sm: &StateMachine) -> Result<()> {
    if !sm.states.contains_key(&sm.initial) {
        return Err(Error::Script(format!(
            "initial state '{}' is not declared in states",
            sm.initial
        )));
    }
    for state in sm.states.values() {
        let targets = [
            ("goto", state.goto.as_ref()),
            ("else_goto", state.else_goto.as_ref()),
            ("on_timeout", state.on_timeout.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, t)| t.map(|t| (kind, t)))
        .chain(state.on_event.values().map(|t| ("on_event", t)));
        for (kind, target) in targets {
            if !sm.states.contains_key(target) {
                return Err(Error::Script(format!(
                    "state '{}': {} target '{}' is not declared",
                    state.name, kind, target
                )));
            }
        }
    }
    Ok(())
}

/// Parse a duration string: `1s`, `500ms`, `1.5s`.
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = |msg: String| Error::invalid("duration", msg);
    if let Some(ms_str) = s.strip_suffix("ms") {
        let ms: f64 = ms_str
            .trim()
            .parse()
            .map_err(|_| invalid(format!("invalid milliseconds value: {}", s)))?;
        to_duration(ms / 1000.0).ok_or_else(|| invalid(format!("out of range: {}", s)))
    } else if let Some(s_str) = s.strip_suffix('s') {
        let secs: f64 = s_str
            .trim()
            .parse()
            .map_err(|_| invalid(format!("invalid seconds value: {}", s)))?;
        to_duration(secs).ok_or_else(|| invalid(format!("out of range: {}", s)))
    } else {
        Err(invalid(format!(
            "duration must end with 's' or 'ms', got: {}",
            s
        )))
    }
}

fn to_duration(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Fractional(f64),
    Text(String),
}

/// Serde helper for optional durations written as milliseconds or as a
/// duration string.
pub(crate) fn deserialize_opt_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    let duration = match raw {
        None => return Ok(None),
        Some(RawDuration::Millis(ms)) => Some(Duration::from_millis(ms)),
        Some(RawDuration::Fractional(ms)) => to_duration(ms / 1000.0),
        Some(RawDuration::Text(text)) => match text.trim().parse::<f64>() {
            Ok(ms) => to_duration(ms / 1000.0),
            Err(_) => Some(parse_duration(&text).map_err(serde::de::Error::custom)?),
        },
    };
    duration
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom("duration must be a non-negative number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CYCLE: &str = r#"
version: 1
vars:
  count: 0
  name: dut
channels:
  zeta: {type: tcp, host: 127.0.0.1, port: 5020}
  alpha: {type: serial, device: /dev/null, baud: 9600}
state_machine:
  initial: s1
  states:
    s1:
      do:
        - set: {count: "$count + 1"}
        - log: "pass $count"
        - wait: 10
        - wait_for_event: ready
        - action: send_text
          args: {text: AT, append_cr: true}
      goto: s2
    s2:
      timeout: 100
      on_timeout: s1
      on_event:
        stop: done
    done:
"#;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(
            parse_duration("1.5s").unwrap(),
            Duration::from_secs_f64(1.5)
        );
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_script() {
        let script = parse_str(CYCLE).unwrap();
        assert_eq!(script.version, 1);
        assert_eq!(script.vars["count"], Value::Int(0));

        let names: Vec<_> = script.channels.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha"]);

        let s1 = &script.state_machine.states["s1"];
        let actions: Vec<_> = s1.actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(actions, ["set", "log", "wait", "wait_for_event", "send_text"]);
        assert_eq!(s1.actions[1].args["message"], Value::from("pass $count"));
        assert_eq!(s1.actions[2].args["ms"], Value::Int(10));
        assert_eq!(s1.actions[3].args["event"], Value::from("ready"));
        assert_eq!(s1.goto.as_deref(), Some("s2"));

        let s2 = &script.state_machine.states["s2"];
        assert_eq!(s2.timeout, Some(Duration::from_millis(100)));
        assert_eq!(s2.on_event["stop"], "done");
        assert!(!s2.is_terminal());
        assert!(script.state_machine.states["done"].is_terminal());
    }

    #[test]
    fn test_duration_strings_in_states() {
        let script = parse_str(
            "state_machine:\n  initial: a\n  states:\n    a: {timeout: 1.5s, on_timeout: a}\n",
        )
        .unwrap();
        assert_eq!(
            script.state_machine.states["a"].timeout,
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_unknown_initial_state() {
        let err = parse_str("state_machine:\n  initial: nowhere\n  states:\n    a: {}\n").unwrap_err();
        assert!(err.to_string().contains("nowhere"), "got: {err}");
    }

    #[test]
    fn test_unknown_transition_target() {
        let err = parse_str(
            "state_machine:\n  initial: a\n  states:\n    a: {on_event: {go: b}}\n",
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("on_event") && msg.contains("'b'"), "got: {msg}");
    }

    #[test]
    fn test_if_branches_are_parsed() {
        let script = parse_str(
            r#"
state_machine:
  initial: a
  states:
    a:
      do:
        - if:
            cond: "$x > 1"
            then: [{log: big}]
            else: [{action: set, args: {x: 0}}]
"#,
        )
        .unwrap();
        let call = &script.state_machine.states["a"].actions[0];
        let branches = call.branches().unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].name, "log");
        assert_eq!(branches[1].name, "set");
    }

    #[test]
    fn test_unknown_item_is_rejected() {
        let err = parse_str(
            "state_machine:\n  initial: a\n  states:\n    a: {do: [{fly: away}]}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("fly"), "got: {err}");
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.yaml");
        std::fs::write(&path, CYCLE).unwrap();
        assert_eq!(parse_file(&path).unwrap(), parse_str(CYCLE).unwrap());
        assert!(matches!(
            parse_file(dir.path().join("missing.yaml")),
            Err(Error::File { .. })
        ));
    }
}
