//! [`RecordStartAction`] and [`RecordStopAction`]: capture a run to disk.
//!
//! Script syntax:
//! ```yaml
//! - action: record_start
//!   args: {dir: runs, name: flash, script_path: flash.yaml}
//! - action: record_stop
//! ```

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::record::Recorder;
use crate::value::Value;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Base directory used when `dir` is not given.
pub const DEFAULT_RECORD_DIR: &str = "runs";

/// Starts recording every later run event to a new directory and stores its
/// path in `record_dir`.
///
/// The script is copied from `script_text` or, failing that, read from
/// `script_path`. While a recording is active this only returns its path.
pub struct RecordStartAction {
    schema: Schema,
}

impl RecordStartAction {
    pub const NAME: &'static str = "record_start";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .optional("dir", Value::Null)
                .optional("name", "run")
                .optional("script_text", Value::Null)
                .optional("script_path", Value::Null)
                .typed("dir", TypeSpec::String)
                .typed("name", TypeSpec::String)
                .typed("script_text", TypeSpec::String)
                .typed("script_path", TypeSpec::String),
        }
    }
}

impl Default for RecordStartAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for RecordStartAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        if let Some(recorder) = ctx.recorder() {
            return Ok(Value::from(recorder.root().display().to_string()));
        }

        let base = args
            .opt_string("dir")?
            .unwrap_or_else(|| DEFAULT_RECORD_DIR.to_string());
        let name = args.opt_string("name")?.filter(|n| !n.is_empty());
        let script = match (args.opt_string("script_text")?, args.opt_string("script_path")?) {
            (Some(text), _) => Some(text),
            (None, Some(path)) => Some(
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| Error::File { path, source })?,
            ),
            (None, None) => None,
        };

        let recorder = Recorder::create(
            Path::new(&base),
            name.as_deref().unwrap_or("run"),
            script.as_deref(),
        )?;
        let root = recorder.root().display().to_string();
        info!(%root, "Recording started");
        ctx.attach_recorder(Arc::new(recorder));
        ctx.set_var("record_dir", root.clone());
        Ok(Value::from(root))
    }
}

/// Closes the active recording, writing the current variables next to the
/// event log. Returns the recording path, or null when nothing was recording.
pub struct RecordStopAction {
    schema: Schema,
}

impl RecordStopAction {
    pub const NAME: &'static str = "record_stop";

    pub fn new() -> Self {
        Self {
            schema: Schema::new(),
        }
    }
}

impl Default for RecordStopAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for RecordStopAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, _args: Args) -> Result<Value> {
        let Some(recorder) = ctx.detach_recorder() else {
            return Ok(Value::Null);
        };
        let root = recorder.close(&ctx.vars_snapshot())?;
        info!(root = %root.display(), "Recording stopped");
        Ok(Value::from(root.display().to_string()))
    }
}
