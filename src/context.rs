//! The [`RuntimeContext`] every action receives when executed.

use crate::action::ActionRegistry;
use crate::channel::{Channel, POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::event::{Direction, Notifier, RunEvent, StopHandle};
use crate::expression;
use crate::frame::ProtocolSchema;
use crate::record::Recorder;
use crate::value::{Value, ValueMap, to_hex};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::debug;

/// Mutable state of one script run.
///
/// Holds the open channels, the variable table, the queue of injected events
/// and the per-run cache of frame schemas. Actions reach channels through
/// [`tap`](Self::tap), which reports all traffic as [`RunEvent::Data`].
pub struct RuntimeContext {
    channels: Vec<(String, Box<dyn Channel>)>,
    active: usize,
    vars: ValueMap,
    last_event: Option<String>,
    events: UnboundedReceiver<String>,
    stop: StopHandle,
    notifier: Notifier,
    schemas: HashMap<PathBuf, Arc<ProtocolSchema>>,
    registry: Arc<ActionRegistry>,
    transaction_id: u16,
    /// Active recorder and the notifier it wraps.
    recording: Option<(Arc<Recorder>, Notifier)>,
}

impl RuntimeContext {
    /// The first channel in `channels` starts out active.
    pub(crate) fn new(
        vars: ValueMap,
        channels: Vec<(String, Box<dyn Channel>)>,
        registry: Arc<ActionRegistry>,
        stop: StopHandle,
        events: UnboundedReceiver<String>,
    ) -> Self {
        Self {
            channels,
            active: 0,
            vars,
            last_event: None,
            events,
            stop,
            notifier: Arc::new(|_| {}),
            schemas: HashMap::new(),
            registry,
            transaction_id: 0,
            recording: None,
        }
    }

    pub(crate) fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = notifier;
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    // ---- variables ----

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn vars(&self) -> &ValueMap {
        &self.vars
    }

    /// Variables as expressions see them, with `event` bound to the last
    /// event label (or null).
    pub fn vars_snapshot(&self) -> ValueMap {
        let mut vars = self.vars.clone();
        match &self.last_event {
            Some(label) => {
                vars.insert("event".into(), Value::Str(label.clone()));
            }
            None => {
                vars.entry("event".into()).or_insert(Value::Null);
            }
        }
        vars
    }

    pub fn last_event(&self) -> Option<&str> {
        self.last_event.as_deref()
    }

    /// Evaluate `value` if it is a string carrying a `$` expression.
    pub fn eval_value(&self, value: &Value) -> Result<Value> {
        let mut value = value.clone();
        self.resolve(&mut value)?;
        Ok(value)
    }

    /// Replace every `$` expression string in `value`, recursing into lists
    /// and mappings.
    pub fn resolve(&self, value: &mut Value) -> Result<()> {
        if !needs_resolving(value) {
            return Ok(());
        }
        resolve_with(value, &self.vars_snapshot())
    }

    /// Evaluate `expr` as a condition. Bare names need no `$` here.
    pub fn eval_condition(&self, expr: &str) -> Result<bool> {
        Ok(expression::evaluate(expr, &self.vars_snapshot())?.is_truthy())
    }

    pub fn interpolate(&self, template: &str) -> Result<String> {
        expression::interpolate(template, &self.vars_snapshot())
    }

    // ---- channels ----

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|(name, _)| name.as_str())
    }

    pub fn active_channel(&self) -> Option<&str> {
        self.channels.get(self.active).map(|(name, _)| name.as_str())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        self.active = self.index_of(Some(name))?;
        debug!(channel = name, "Active channel changed");
        Ok(())
    }

    fn index_of(&self, name: Option<&str>) -> Result<usize> {
        match name {
            Some(name) => self
                .channels
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| Error::UnknownChannel(name.to_string())),
            None if self.channels.is_empty() => {
                Err(Error::UnknownChannel("(no channel declared)".into()))
            }
            None => Ok(self.active),
        }
    }

    /// Borrow channel `name`, or the active channel when `None`.
    pub fn tap(&mut self, name: Option<&str>) -> Result<Tap<'_>> {
        let index = self.index_of(name)?;
        let (name, channel) = &mut self.channels[index];
        Ok(Tap {
            name: name.as_str(),
            channel: Interruptible {
                inner: channel.as_mut(),
                stop: &self.stop,
            },
            notifier: &self.notifier,
        })
    }

    pub async fn write(&mut self, name: Option<&str>, data: &[u8]) -> Result<()> {
        self.tap(name)?.write(data).await
    }

    /// Next event label: the injected queue first, then one byte from the
    /// active channel within `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<Option<String>> {
        let label = match self.events.try_recv() {
            Ok(label) => Some(label),
            Err(_) if self.channels.is_empty() => {
                self.stop.sleep(timeout).await?;
                self.events.try_recv().ok()
            }
            Err(_) => self.tap(None)?.read_event(timeout).await?,
        };
        if let Some(label) = &label {
            debug!(event = %label, "Event received");
            self.last_event = Some(label.clone());
            self.vars.insert("event".into(), Value::Str(label.clone()));
        }
        Ok(label)
    }

    // ---- run control ----

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Sleep for `duration`, returning [`Error::Stopped`] early on a stop
    /// request.
    pub fn sleep(&self, duration: Duration) -> impl Future<Output = Result<()>> + Send + 'static {
        let stop = self.stop.clone();
        async move { stop.sleep(duration).await }
    }

    pub fn emit(&self, event: RunEvent) {
        (self.notifier)(&event);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(RunEvent::Log {
            message: message.into(),
        });
    }

    // ---- protocol state ----

    /// Load the frame schema at `path`, once per run.
    pub fn schema(&mut self, path: &str) -> Result<Arc<ProtocolSchema>> {
        let key = PathBuf::from(path);
        if let Some(schema) = self.schemas.get(&key) {
            return Ok(Arc::clone(schema));
        }
        let schema = Arc::new(ProtocolSchema::load(&key)?);
        debug!(path, "Loaded frame schema");
        self.schemas.insert(key, Arc::clone(&schema));
        Ok(schema)
    }

    pub fn recorder(&self) -> Option<&Arc<Recorder>> {
        self.recording.as_ref().map(|(recorder, _)| recorder)
    }

    /// Copy every later [`RunEvent`] to `recorder` as well.
    pub(crate) fn attach_recorder(&mut self, recorder: Arc<Recorder>) {
        let previous = Arc::clone(&self.notifier);
        let forward = Arc::clone(&previous);
        let sink = Arc::clone(&recorder);
        self.notifier = Arc::new(move |event| {
            forward(event);
            sink.record(event);
        });
        self.recording = Some((recorder, previous));
    }

    pub(crate) fn detach_recorder(&mut self) -> Option<Arc<Recorder>> {
        let (recorder, previous) = self.recording.take()?;
        self.notifier = previous;
        Some(recorder)
    }

    pub(crate) fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}

fn needs_resolving(value: &Value) -> bool {
    match value {
        Value::Str(s) => expression::is_expression(s),
        Value::List(items) => items.iter().any(needs_resolving),
        Value::Map(map) => map.values().any(needs_resolving),
        _ => false,
    }
}

fn resolve_with(value: &mut Value, vars: &ValueMap) -> Result<()> {
    match value {
        Value::Str(s) if expression::is_expression(s) => {
            *value = expression::evaluate(s, vars)?;
        }
        Value::List(items) => {
            for item in items {
                resolve_with(item, vars)?;
            }
        }
        Value::Map(map) => {
            for item in map.values_mut() {
                resolve_with(item, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// A borrowed channel that reports its traffic and honours stop requests.
///
/// Each write and each completed read is logged at debug level as hex and
/// sent to the run's notifier as [`RunEvent::Data`]. Reads give up with
/// [`Error::Stopped`] within one [`POLL_INTERVAL`] of a stop request.
pub struct Tap<'a> {
    name: &'a str,
    channel: Interruptible<'a>,
    notifier: &'a Notifier,
}

impl Tap<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    fn record(&self, direction: Direction, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        debug!(channel = self.name, "{} {}", direction, to_hex(bytes));
        (self.notifier)(&RunEvent::Data {
            channel: self.name.to_string(),
            direction,
            bytes: bytes.to_vec(),
        });
    }
}

#[async_trait]
impl Channel for Tap<'_> {
    fn describe(&self) -> String {
        self.channel.describe()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.channel.write(data).await?;
        self.record(Direction::Tx, data);
        Ok(())
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        let data = self.channel.read(max, timeout).await?;
        self.record(Direction::Rx, &data);
        Ok(data)
    }

    async fn read_exact(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let data = self.channel.read_exact(size, timeout).await?;
        self.record(Direction::Rx, &data);
        Ok(data)
    }

    async fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let data = self.channel.read_until(terminator, timeout).await?;
        self.record(Direction::Rx, &data);
        Ok(data)
    }

    async fn read_event(&mut self, timeout: Duration) -> Result<Option<String>> {
        let label = self.channel.read_event(timeout).await?;
        if let Some(label) = &label {
            self.record(Direction::Rx, label.as_bytes());
        }
        Ok(label)
    }

    async fn discard_input(&mut self, quiet: Duration) -> Result<usize> {
        let dropped = self.channel.discard_input(quiet).await?;
        if dropped > 0 {
            debug!(channel = self.name, dropped, "Discarded stale input");
        }
        Ok(dropped)
    }
}

/// Slices every read into [`POLL_INTERVAL`] steps and checks the stop flag
/// between them. The polling loops of [`Channel`] run on top of this, so
/// they see the stop too.
struct Interruptible<'a> {
    inner: &'a mut dyn Channel,
    stop: &'a StopHandle,
}

#[async_trait]
impl Channel for Interruptible<'_> {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(Error::Stopped);
        }
        self.inner.write(data).await
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stop.is_stopped() {
                return Err(Error::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let data = self.inner.read(max, remaining.min(POLL_INTERVAL)).await?;
            if !data.is_empty() || remaining <= POLL_INTERVAL {
                return Ok(data);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::channel::{MockChannel, MockHandle};
    use crate::event::EventSender;

    /// A context over mock channels named `names`, with the builtin
    /// registry.
    pub(crate) fn mock_context(
        names: &[&str],
        vars: ValueMap,
    ) -> (RuntimeContext, Vec<MockHandle>, EventSender) {
        let mut channels: Vec<(String, Box<dyn Channel>)> = Vec::new();
        let mut handles = Vec::new();
        for name in names {
            let (channel, handle) = MockChannel::new(*name);
            channels.push((name.to_string(), Box::new(channel)));
            handles.push(handle);
        }
        let (sender, rx) = EventSender::channel();
        let ctx = RuntimeContext::new(
            vars,
            channels,
            Arc::new(ActionRegistry::builtin()),
            StopHandle::new(),
            rx,
        );
        (ctx, handles, sender)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::mock_context;
    use super::*;
    use crate::value_map;
    use std::sync::Mutex;

    #[test]
    fn test_resolve_nested_expressions() {
        let (ctx, _, _) = mock_context(&[], value_map! { "base" => 10, "name" => "dut" });
        let mut value = Value::Map(value_map! {
            "a" => "$base + 1",
            "b" => Value::List(vec![Value::from("$name"), Value::from("plain")]),
        });
        ctx.resolve(&mut value).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map["a"], Value::Int(11));
        assert_eq!(
            map["b"],
            Value::List(vec![Value::from("dut"), Value::from("plain")])
        );
    }

    #[test]
    fn test_condition_sees_event() {
        let (mut ctx, _, _) = mock_context(&[], ValueMap::new());
        assert!(ctx.eval_condition("event == None").unwrap());
        ctx.last_event = Some("G".into());
        assert!(ctx.eval_condition("event == 'G'").unwrap());
    }

    #[tokio::test]
    async fn test_tap_reports_traffic() {
        let (mut ctx, handles, _) = mock_context(&["a", "b"], ValueMap::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.set_notifier(Arc::new(move |e: &RunEvent| {
            if let RunEvent::Data {
                channel, direction, ..
            } = e
            {
                sink.lock().unwrap().push(format!("{}:{}", channel, direction));
            }
        }));

        handles[1].respond_with(|_| Some(b"pong\n".to_vec()));
        ctx.set_active("b").unwrap();
        ctx.write(None, b"ping\n").await.unwrap();
        let line = ctx
            .tap(None)
            .unwrap()
            .read_until(b"\n", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(line, b"pong\n");
        assert_eq!(*seen.lock().unwrap(), ["b:TX", "b:RX"]);
        assert_eq!(handles[0].write_count(), 0);

        assert!(matches!(ctx.set_active("zz"), Err(Error::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn test_next_event_prefers_queue() {
        let (mut ctx, handles, sender) = mock_context(&["dut"], ValueMap::new());
        handles[0].push(b"R");
        sender.send("from-queue");
        let first = ctx.next_event(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.as_deref(), Some("from-queue"));
        let second = ctx.next_event(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.as_deref(), Some("R"));
        assert_eq!(ctx.var("event"), Some(&Value::from("R")));
        assert_eq!(ctx.next_event(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sleep_observes_stop() {
        let (ctx, _, _) = mock_context(&[], ValueMap::new());
        ctx.stop_handle().stop();
        assert!(matches!(
            ctx.sleep(Duration::from_secs(5)).await,
            Err(Error::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_tap_reads_observe_stop() {
        let (mut ctx, _handles, _) = mock_context(&["dut"], ValueMap::new());
        let stop = ctx.stop_handle().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.stop();
        });
        let start = std::time::Instant::now();
        let err = ctx
            .tap(None)
            .unwrap()
            .read_until(b"\n", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stopped));
        assert!(start.elapsed() < Duration::from_secs(1));

        let err = ctx.tap(None).unwrap().read_exact(4, Duration::from_secs(5)).await;
        assert!(matches!(err, Err(Error::Stopped)));
        assert!(matches!(ctx.next_event(Duration::from_secs(5)).await, Err(Error::Stopped)));
    }

    #[test]
    fn test_schema_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proto.yaml");
        std::fs::write(&path, "frames:\n  ping:\n    header: 'AA'\n    fields: []\n").unwrap();
        let (mut ctx, _, _) = mock_context(&[], ValueMap::new());
        let path = path.to_string_lossy().into_owned();
        let first = ctx.schema(&path).unwrap();
        let second = ctx.schema(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
