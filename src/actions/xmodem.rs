//! XMODEM family actions: single blocks driven by the script
//! ([`SendXmodemBlockAction`], [`SendEotAction`]) and complete transfers
//! ([`FileTransferAction`]).

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::protocol::xmodem::{
    BLOCK_SIZE, TransferOptions, block_count, build_block, build_eot, send_xmodem, send_ymodem,
};
use crate::value::Value;
use crate::value_map;
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

async fn read_file(path: &str) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| Error::File {
        path: path.to_string(),
        source,
    })
}

/// Sends block `block` (1-based) of the firmware file as one 128-byte
/// XMODEM packet.
///
/// The file is the `file` argument, or else the `file_path` variable. The
/// file's metadata is published as `file` (`{path, size, block_count}`),
/// `file.size`, `file.block_count`, `file_size` and `file_block_count`,
/// and the block number as `last_sent_block`, so a state machine can loop
/// over the blocks itself and react to ACK/NAK events.
pub struct SendXmodemBlockAction {
    schema: Schema,
}

impl SendXmodemBlockAction {
    pub const NAME: &'static str = "send_xmodem_block";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("path", "file")
                .optional("block", 1)
                .optional("file", Value::Null)
                .optional("use_crc", true)
                .optional("channel", Value::Null)
                .typed("block", TypeSpec::Integer)
                .typed("file", TypeSpec::String)
                .typed("use_crc", TypeSpec::Bool)
                .typed("channel", TypeSpec::String),
        }
    }
}

impl Default for SendXmodemBlockAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for SendXmodemBlockAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let path = match args.opt_string("file")? {
            Some(path) => path,
            None => match ctx.var("file_path") {
                Some(Value::Str(path)) => path.clone(),
                _ => {
                    return Err(Error::MissingArgument {
                        action: Self::NAME.to_string(),
                        arg: "file".into(),
                    });
                }
            },
        };
        let data = read_file(&path).await?;
        let blocks = block_count(data.len());
        ctx.set_var(
            "file",
            value_map! { "path" => path.as_str(), "size" => data.len(), "block_count" => blocks },
        );
        ctx.set_var("file.size", data.len());
        ctx.set_var("file.block_count", blocks);
        ctx.set_var("file_size", data.len());
        ctx.set_var("file_block_count", blocks);

        let block: usize = args.int_in("block", 1..=i64::from(u32::MAX))?;
        if block > blocks {
            return Err(Error::invalid(
                "block",
                format!("{} is past the end of {} ({} blocks)", block, path, blocks),
            ));
        }
        let start = (block - 1) * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(data.len());
        let packet = build_block(block, &data[start..end], args.bool("use_crc")?);

        let channel = args.opt_string("channel")?;
        ctx.write(channel.as_deref(), &packet).await?;
        ctx.set_var("last_sent_block", block);
        Ok(Value::from(block))
    }
}

/// Sends the XMODEM end-of-transmission byte.
pub struct SendEotAction {
    schema: Schema,
}

impl SendEotAction {
    pub const NAME: &'static str = "send_eot";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .optional("channel", Value::Null)
                .typed("channel", TypeSpec::String),
        }
    }
}

impl Default for SendEotAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for SendEotAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let channel = args.opt_string("channel")?;
        ctx.write(channel.as_deref(), &build_eot()).await?;
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Xmodem,
    Ymodem,
}

/// A complete file transfer handshake: `xmodem_send` or `ymodem_send`.
///
/// Waits up to `start_timeout` for the receiver, re-sends each block up to
/// `retries` times and stores a summary in `last_transfer`.
pub struct FileTransferAction {
    name: &'static str,
    flavor: Flavor,
    schema: Schema,
}

impl FileTransferAction {
    pub const XMODEM_NAME: &'static str = "xmodem_send";
    pub const YMODEM_NAME: &'static str = "ymodem_send";

    pub fn xmodem() -> Self {
        Self::with(Self::XMODEM_NAME, Flavor::Xmodem)
    }

    pub fn ymodem() -> Self {
        Self::with(Self::YMODEM_NAME, Flavor::Ymodem)
    }

    fn with(name: &'static str, flavor: Flavor) -> Self {
        Self {
            name,
            flavor,
            schema: Schema::new()
                .alias("path", "file")
                .required("file")
                .optional("channel", Value::Null)
                .optional("retries", 10)
                .optional("start_timeout", "10s")
                .optional("block_timeout", "3s")
                .typed("file", TypeSpec::String)
                .typed("channel", TypeSpec::String)
                .typed("retries", TypeSpec::Integer)
                .typed("start_timeout", TypeSpec::Duration)
                .typed("block_timeout", TypeSpec::Duration),
        }
    }
}

#[async_trait]
impl Action for FileTransferAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let path = args.string("file")?;
        let data = read_file(&path).await?;
        let options = TransferOptions {
            retries: args.int_in("retries", 0..=1000)?,
            start_timeout: args.duration("start_timeout")?,
            block_timeout: args.duration("block_timeout")?,
        };
        let stop = ctx.stop_handle().clone();
        let channel = args.opt_string("channel")?;
        let mut tap = ctx.tap(channel.as_deref())?;

        let report = match self.flavor {
            Flavor::Xmodem => send_xmodem(&mut tap, &data, &options, &stop).await?,
            Flavor::Ymodem => {
                let name = Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                send_ymodem(&mut tap, &name, &data, &options, &stop).await?
            }
        };
        info!(file = %path, blocks = report.blocks, resent = report.resent, "File transfer complete");

        let summary = Value::Map(value_map! {
            "file" => path.as_str(),
            "bytes" => report.bytes,
            "blocks" => report.blocks,
            "resent" => i64::from(report.resent),
            "crc" => report.crc,
        });
        ctx.set_var("last_transfer", summary.clone());
        Ok(summary)
    }
}
