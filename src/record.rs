//! On-disk recording of a run.
//!
//! A recording is a directory `<base>/<name>_<timestamp>/` holding
//! `events.log` (one timestamped line per [`RunEvent`]), an optional copy of
//! the script as `script.yaml` and, once closed, the final variables as
//! `vars.yaml`.

use crate::error::{Error, Result};
use crate::event::{RunEvent, TransitionReason};
use crate::value::{ValueMap, to_hex};
use chrono::Local;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const EVENTS_FILE: &str = "events.log";
pub const SCRIPT_FILE: &str = "script.yaml";
pub const VARS_FILE: &str = "vars.yaml";

pub struct Recorder {
    root: PathBuf,
    events: Mutex<BufWriter<File>>,
}

impl Recorder {
    /// Create the recording directory under `base` and open its event log.
    pub fn create(base: &Path, name: &str, script: Option<&str>) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let root = base.join(format!("{}_{}", name, stamp));
        fs::create_dir_all(&root).map_err(|source| file_error(&root, source))?;

        if let Some(text) = script {
            let path = root.join(SCRIPT_FILE);
            fs::write(&path, text).map_err(|source| file_error(&path, source))?;
        }

        let path = root.join(EVENTS_FILE);
        let file = File::create(&path).map_err(|source| file_error(&path, source))?;
        debug!(root = %root.display(), "Recording created");
        Ok(Self {
            root,
            events: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append `event` to the event log. Write failures are only logged.
    pub fn record(&self, event: &RunEvent) {
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        let stamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        if let Err(e) = writeln!(events, "{} {}", stamp, describe(event)) {
            warn!(root = %self.root.display(), error = %e, "Cannot write recording");
        }
    }

    /// Flush the event log and write `vars` to `vars.yaml`.
    pub fn close(&self, vars: &ValueMap) -> Result<PathBuf> {
        if let Ok(mut events) = self.events.lock() {
            let path = self.root.join(EVENTS_FILE);
            events.flush().map_err(|source| file_error(&path, source))?;
        }
        let path = self.root.join(VARS_FILE);
        fs::write(&path, serde_yaml::to_string(vars)?).map_err(|source| file_error(&path, source))?;
        Ok(self.root.clone())
    }
}

fn file_error(path: &Path, source: std::io::Error) -> Error {
    Error::File {
        path: path.display().to_string(),
        source,
    }
}

fn describe(event: &RunEvent) -> String {
    match event {
        RunEvent::Started { initial } => format!("START {}", initial),
        RunEvent::StateEntered { state } => format!("STATE {}", state),
        RunEvent::Transition { from, to, reason } => {
            let why = match reason {
                TransitionReason::Goto => "goto".to_string(),
                TransitionReason::ElseGoto => "else_goto".to_string(),
                TransitionReason::Event(label) => format!("event {:?}", label),
                TransitionReason::Timeout => "timeout".to_string(),
            };
            format!("GOTO {} -> {} ({})", from, to, why)
        }
        RunEvent::Log { message } => format!("LOG {}", message),
        RunEvent::Data {
            channel,
            direction,
            bytes,
        } => format!("{} {} {}", direction, channel, to_hex(bytes)),
        RunEvent::Finished { state } => format!("FINISH {}", state),
        RunEvent::Stopped { state } => format!("STOP {}", state),
        RunEvent::Failed {
            state,
            action,
            message,
        } => match action {
            Some(action) => format!("FAIL {}.{}: {}", state, action, message),
            None => format!("FAIL {}: {}", state, message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Direction;
    use crate::value_map;

    #[test]
    fn test_recording_layout() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::create(dir.path(), "smoke", Some("version: 1\n")).unwrap();
        assert!(rec.root().starts_with(dir.path()));
        assert!(
            rec.root()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("smoke_")
        );

        rec.record(&RunEvent::StateEntered { state: "scan".into() });
        rec.record(&RunEvent::Data {
            channel: "dut".into(),
            direction: Direction::Tx,
            bytes: vec![0x41, 0x54],
        });
        let root = rec.close(&value_map! { "count" => 2 }).unwrap();

        let events = fs::read_to_string(root.join(EVENTS_FILE)).unwrap();
        let lines: Vec<&str> = events.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" STATE scan"), "{}", lines[0]);
        assert!(lines[1].ends_with(" TX dut 4154"), "{}", lines[1]);
        assert_eq!(fs::read_to_string(root.join(SCRIPT_FILE)).unwrap(), "version: 1\n");
        assert!(fs::read_to_string(root.join(VARS_FILE)).unwrap().contains("count: 2"));
    }

    #[test]
    fn test_unwritable_base_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("plain-file");
        fs::write(&blocker, "x").unwrap();
        let err = Recorder::create(&blocker, "run", None).err().unwrap();
        assert!(matches!(err, Error::File { .. }), "got: {err}");
    }
}
