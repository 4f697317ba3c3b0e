use anyhow::{Context, Result, bail};
use clap::Parser;
use devscript::{Executor, RunEvent, RunOutcome, parse_file};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "devscript",
    about = "Run a device test script against serial and TCP channels",
    version
)]
struct Args {
    /// Path to the script file
    #[arg(short, long)]
    script: String,

    /// Event label to queue before the run starts (repeatable)
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .with_context(|| format!("Invalid log level: {}", args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let script = parse_file(&args.script)
        .with_context(|| format!("Failed to parse script file: {}", args.script))?;

    let mut executor = Executor::connect(script)
        .await
        .context("Failed to open channels")?;

    executor.on_event(|event| {
        if let RunEvent::Log { message } = event {
            println!("{}", message);
        }
    });

    let events = executor.event_sender();
    for label in args.events {
        events.send(label);
    }

    let stop = executor.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    match executor.run().await.context("Script failed")? {
        RunOutcome::Completed { .. } => Ok(()),
        RunOutcome::Stopped { state } => bail!("Stopped in state '{}'", state),
    }
}
