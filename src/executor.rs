//! The state machine [`Executor`] that drives a [`Script`] to completion.

use crate::action::{ActionRegistry, dispatch};
use crate::channel::{self, Channel};
use crate::context::RuntimeContext;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{EventSender, RunEvent, StopHandle, TransitionReason};
use crate::script::{Script, State};
use crate::value::ValueMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Longest single wait for an event before the stop flag is checked again.
pub const EVENT_POLL: Duration = Duration::from_millis(100);

/// How a run ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A terminal state was reached
    Completed { state: String },

    /// A stop was requested while in `state`
    Stopped { state: String },
}

/// What to do after a state has run.
enum Step {
    Goto(String, TransitionReason),
    Finish,
}

/// Runs one script against its channels.
///
/// ```no_run
/// use devscript::{Executor, RunOutcome, parse_file};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let script = parse_file("smoke.yaml")?;
///     let mut executor = Executor::connect(script).await?;
///     let stop = executor.stop_handle();
///     tokio::spawn(async move {
///         tokio::signal::ctrl_c().await.ok();
///         stop.stop();
///     });
///     if let RunOutcome::Stopped { state } = executor.run().await? {
///         eprintln!("stopped in {}", state);
///     }
///     Ok(())
/// }
/// ```
pub struct Executor {
    script: Script,
    ctx: RuntimeContext,
    events: EventSender,
}

impl Executor {
    /// Open every channel the script declares, in declaration order.
    ///
    /// # Errors
    ///
    /// The first channel that fails to open aborts the connect with a
    /// connectivity or script error.
    pub async fn connect(script: Script) -> Result<Self> {
        let mut channels: Vec<(String, Box<dyn Channel>)> = Vec::with_capacity(script.channels.len());
        for (name, config) in &script.channels {
            let channel = channel::open(name, config).await?;
            info!(channel = %name, endpoint = %channel.describe(), "Channel opened");
            channels.push((name.clone(), channel));
        }
        Ok(Self::with_channels(script, channels))
    }

    /// Run `script` over already opened channels, using the builtin actions.
    pub fn with_channels(script: Script, channels: Vec<(String, Box<dyn Channel>)>) -> Self {
        Self::with_registry(script, channels, Arc::new(ActionRegistry::builtin()))
    }

    pub fn with_registry(
        script: Script,
        channels: Vec<(String, Box<dyn Channel>)>,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        let (events, rx) = EventSender::channel();
        let ctx = RuntimeContext::new(script.vars.clone(), channels, registry, StopHandle::new(), rx);
        Self { script, ctx, events }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.ctx.stop_handle().clone()
    }

    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// Deliver every [`RunEvent`] to `handler`.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        self.ctx.set_notifier(Arc::new(handler));
    }

    /// Variables as they stand, also after the run has ended.
    pub fn vars(&self) -> &ValueMap {
        self.ctx.vars()
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// Execute states from `initial` until a terminal state, a stop request
    /// or an error.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAction`] if the script names an unregistered action,
    /// checked before anything runs. An action failure comes back as
    /// [`Error::Action`] carrying the state and action name.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.ctx.registry().check_script(&self.script)?;

        let mut current = self.script.state_machine.initial.clone();
        info!(initial = %current, "Run started");
        self.ctx.emit(RunEvent::Started {
            initial: current.clone(),
        });

        loop {
            let state = self
                .script
                .state_machine
                .states
                .get(&current)
                .ok_or_else(|| Error::Script(format!("state '{}' is not declared", current)))?;

            match run_state(&mut self.ctx, state).await {
                Ok(Step::Goto(next, reason)) => {
                    info!(from = %current, to = %next, ?reason, "Transition");
                    self.ctx.emit(RunEvent::Transition {
                        from: current.clone(),
                        to: next.clone(),
                        reason,
                    });
                    current = next;
                }
                Ok(Step::Finish) => {
                    info!(state = %current, "Run finished");
                    self.ctx.emit(RunEvent::Finished {
                        state: current.clone(),
                    });
                    return Ok(RunOutcome::Completed { state: current });
                }
                Err(err) if err.kind() == ErrorKind::Stopped => {
                    info!(state = %current, "Run stopped");
                    self.ctx.emit(RunEvent::Stopped {
                        state: current.clone(),
                    });
                    return Ok(RunOutcome::Stopped { state: current });
                }
                Err(err) => {
                    error!(state = %current, error = %err, "Run failed");
                    let action = match &err {
                        Error::Action { action, .. } => Some(action.clone()),
                        _ => None,
                    };
                    self.ctx.emit(RunEvent::Failed {
                        state: current,
                        action,
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            }
        }
    }
}

async fn run_state(ctx: &mut RuntimeContext, state: &State) -> Result<Step> {
    if ctx.is_stopped() {
        return Err(Error::Stopped);
    }
    debug!(state = %state.name, "Entering state");
    ctx.emit(RunEvent::StateEntered {
        state: state.name.clone(),
    });

    if let Some(cond) = &state.when {
        let pass = ctx.eval_condition(cond).map_err(|source| Error::Guard {
            state: state.name.clone(),
            source: Box::new(source),
        })?;
        if !pass {
            debug!(state = %state.name, %cond, "Guard is false");
            return Ok(match &state.else_goto {
                Some(target) => Step::Goto(target.clone(), TransitionReason::ElseGoto),
                None => Step::Finish,
            });
        }
    }

    for call in &state.actions {
        if ctx.is_stopped() {
            return Err(Error::Stopped);
        }
        dispatch(ctx, call).await.map_err(|source| match source {
            Error::Stopped => Error::Stopped,
            source => Error::Action {
                state: state.name.clone(),
                action: call.name.clone(),
                source: Box::new(source),
            },
        })?;
    }

    if let Some(target) = &state.goto {
        return Ok(Step::Goto(target.clone(), TransitionReason::Goto));
    }
    if state.is_terminal() {
        return Ok(Step::Finish);
    }
    wait_for_transition(ctx, state).await
}

/// Consume events until one matches `on_event` or the state's timeout
/// passes. Unmatched events only update `event`.
async fn wait_for_transition(ctx: &mut RuntimeContext, state: &State) -> Result<Step> {
    let deadline = state.timeout.map(|t| Instant::now() + t);
    loop {
        if ctx.is_stopped() {
            return Err(Error::Stopped);
        }
        let tick = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(match &state.on_timeout {
                        Some(target) => Step::Goto(target.clone(), TransitionReason::Timeout),
                        None => Step::Finish,
                    });
                }
                remaining.min(EVENT_POLL)
            }
            None => EVENT_POLL,
        };

        if let Some(label) = ctx.next_event(tick).await? {
            if let Some(target) = state.on_event.get(&label) {
                return Ok(Step::Goto(target.clone(), TransitionReason::Event(label)));
            }
            debug!(state = %state.name, event = %label, "Unhandled event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::script::parse_str;
    use crate::value::Value;
    use std::sync::Mutex;

    fn recorder(executor: &mut Executor) -> Arc<Mutex<Vec<RunEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        executor.on_event(move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[tokio::test]
    async fn test_stop_mid_wait_keeps_vars() {
        let script = parse_str(
            r#"
vars: {count: 0}
state_machine:
  initial: s1
  states:
    s1:
      do: [{set: {count: "$count + 1"}}]
      goto: s2
    s2:
      timeout: 40
      on_timeout: s1
"#,
        )
        .unwrap();
        let mut executor = Executor::with_channels(script, Vec::new());
        let seen = recorder(&mut executor);
        let stop = executor.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            stop.stop();
        });

        let outcome = executor.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped { .. }));

        let entered_s1 = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, RunEvent::StateEntered { state } if state == "s1"))
            .count() as i64;
        assert!(entered_s1 >= 2, "only {entered_s1} cycles");
        assert_eq!(executor.vars()["count"], Value::Int(entered_s1));
    }

    #[tokio::test]
    async fn test_event_selects_transition() {
        let script = parse_str(
            r#"
state_machine:
  initial: idle
  states:
    idle:
      on_event: {go: busy}
    busy:
      do: [{log: "got $event"}]
"#,
        )
        .unwrap();
        let mut executor = Executor::with_channels(script, Vec::new());
        let seen = recorder(&mut executor);
        let events = executor.event_sender();
        events.send("noise");
        events.send("go");

        let outcome = executor.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { state: "busy".into() });
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&RunEvent::Transition {
            from: "idle".into(),
            to: "busy".into(),
            reason: TransitionReason::Event("go".into()),
        }));
        assert!(seen.contains(&RunEvent::Log {
            message: "got go".into()
        }));
    }

    #[tokio::test]
    async fn test_guard_and_timeout_without_target() {
        let script = parse_str(
            r#"
vars: {armed: false}
state_machine:
  initial: check
  states:
    check:
      when: "$armed"
      goto: fire
      else_goto: idle
    fire: ~
    idle:
      timeout: 30
"#,
        )
        .unwrap();
        let mut executor = Executor::with_channels(script, Vec::new());
        let outcome = executor.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { state: "idle".into() });
    }

    #[tokio::test]
    async fn test_action_failure_names_state_and_action() {
        let script = parse_str(
            r#"
state_machine:
  initial: probe
  states:
    probe:
      do:
        - action: read_line
          args: {channel: nowhere}
"#,
        )
        .unwrap();
        let (channel, _handle) = MockChannel::new("dut");
        let mut executor =
            Executor::with_channels(script, vec![("dut".into(), Box::new(channel) as Box<dyn Channel>)]);
        let seen = recorder(&mut executor);

        let err = executor.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(
            err,
            Error::Action { ref state, ref action, .. } if state == "probe" && action == "read_line"
        ));
        assert!(seen.lock().unwrap().iter().any(|e| matches!(
            e,
            RunEvent::Failed { action: Some(a), .. } if a == "read_line"
        )));
    }

    #[tokio::test]
    async fn test_guard_failure_names_state() {
        let script = parse_str(
            r#"
state_machine:
  initial: start
  states:
    start:
      goto: check
    check:
      when: "$missing > 1"
      goto: start
"#,
        )
        .unwrap();
        let mut executor = Executor::with_channels(script, Vec::new());
        let seen = recorder(&mut executor);

        let err = executor.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expression);
        assert!(matches!(err, Error::Guard { ref state, .. } if state == "check"));
        assert!(err.to_string().contains("check"), "got: {err}");
        assert!(matches!(err.root(), Error::UnknownVariable(n) if n == "missing"));
        assert!(seen.lock().unwrap().iter().any(|e| matches!(
            e,
            RunEvent::Failed { state, action: None, .. } if state == "check"
        )));
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected_before_running() {
        let script = parse_str(
            r#"
vars: {n: 0}
state_machine:
  initial: a
  states:
    a:
      do:
        - set: {n: 1}
        - if:
            cond: "$n == 1"
            then: [{action: teleport}]
"#,
        )
        .unwrap();
        let mut executor = Executor::with_channels(script, Vec::new());
        let err = executor.run().await.unwrap_err();
        assert!(matches!(err, Error::UnknownAction(ref n) if n == "teleport"));
        assert_eq!(executor.vars()["n"], Value::Int(0));
    }
}
