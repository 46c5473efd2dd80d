use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use dbgscope_agent::{DbgviewReader, LogSink, ReaderOptions, StopReason};
use dbgscope_logs::{LineBuffer, RecordFilter};

mod config;
mod output;

use config::Config;
use output::RecordPrinter;

/// Dbgscope - Stream debug output from a remote DebugView agent
#[derive(Parser, Debug)]
#[command(name = "dbgscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host running the DebugView agent (overrides the config file)
    #[arg(value_name = "HOST")]
    host: Option<String>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Agent TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Line buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Only print messages matching this regex
    #[arg(long, value_name = "REGEX")]
    filter: Option<String>,

    /// Match the filter case-insensitively
    #[arg(long, short = 'i')]
    ignore_case: bool,

    /// Print messages that do NOT match
    #[arg(long, short = 'v')]
    invert: bool,

    /// Only print messages from this process id (repeatable)
    #[arg(long = "pid", value_name = "PID")]
    pids: Vec<u32>,

    /// Print one JSON object per record
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Diagnostics go to stderr, stdout carries the records
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run_app(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = &args.host {
        config.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }
    Ok(config)
}

fn build_filter(args: &Args) -> Result<RecordFilter> {
    let pattern = args.filter.as_deref().unwrap_or("");
    let filter = if args.ignore_case {
        RecordFilter::new_case_insensitive(pattern)
    } else {
        RecordFilter::new(pattern)
    }
    .with_context(|| format!("Invalid filter pattern '{}'", pattern))?;

    let filter = filter.with_pids(args.pids.iter().copied());
    Ok(if args.invert { filter.inverted() } else { filter })
}

async fn run_app(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    let Some(host) = config.host.clone() else {
        anyhow::bail!("No agent host given; pass HOST or set `host` in the config file");
    };
    let printer = RecordPrinter::new(build_filter(&args)?, args.json);

    let lines = Arc::new(
        LineBuffer::new(config.buffer_size, config.producer_timeout())
            .context("Failed to allocate line buffer")?,
    );

    // Printer thread is the single consumer of the line buffer
    let consumer = {
        let lines = Arc::clone(&lines);
        let poll_interval = config.poll_interval();
        tokio::task::spawn_blocking(move || {
            let stdout = io::stdout();
            output::drain(&lines, &printer, poll_interval, &mut stdout.lock())
        })
    };

    let options = ReaderOptions::new(host).with_port(config.port);
    let reader = DbgviewReader::spawn(options, Arc::clone(&lines) as Arc<dyn LogSink>);
    info!(agent = %reader.description(), "reader started");

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let (reason, printed) = supervise(reader, consumer, &lines, interrupt).await?;

    if let Err(e) = printed {
        // Closed stdout is a normal way to end a pipeline
        if e.kind() != io::ErrorKind::BrokenPipe {
            return Err(e).context("Failed to write records");
        }
    }

    if lines.dropped() > 0 {
        warn!(dropped = lines.dropped(), "records were dropped because output fell behind");
    }

    match reason {
        StopReason::Requested => Ok(()),
        StopReason::Failed(e) => Err(e).context("Agent session ended"),
        StopReason::Aborted => anyhow::bail!("Reader task aborted"),
    }
}

/// Whichever side of the pipeline finished first
enum Finished {
    Reader(StopReason),
    Printer(std::result::Result<io::Result<()>, JoinError>),
    Interrupted,
}

/// Run until the reader ends, the printer gives up, or `interrupt` fires,
/// then wind down the other side.
async fn supervise(
    mut reader: DbgviewReader,
    mut printer: JoinHandle<io::Result<()>>,
    lines: &LineBuffer,
    interrupt: impl Future<Output = ()>,
) -> Result<(StopReason, io::Result<()>)> {
    let finished = tokio::select! {
        reason = reader.wait() => Finished::Reader(reason),
        printed = &mut printer => Finished::Printer(printed),
        _ = interrupt => Finished::Interrupted,
    };

    let (reason, printed) = match finished {
        Finished::Reader(reason) => {
            lines.request_stop();
            (reason, printer.await)
        }
        Finished::Printer(printed) => {
            info!("output closed, stopping reader");
            (reader.stop().await, printed)
        }
        Finished::Interrupted => {
            info!("interrupted, stopping reader");
            let reason = reader.stop().await;
            lines.request_stop();
            (reason, printer.await)
        }
    };

    let printed = printed.context("Printer thread panicked")?;
    Ok((reason, printed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use dbgscope_agent::INIT_COMMAND;

    /// Writer whose reader went away, like stdout piped into `head`
    struct ClosedPipe;

    impl io::Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_closed_output_stops_idle_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Agent that completes the handshake and then only sends keepalives
        let agent = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut init = vec![0u8; INIT_COMMAND.len()];
            socket.read_exact(&mut init).await.unwrap();
            socket.write_all(&0u32.to_le_bytes()).await.unwrap();
            socket.write_all(&1000u32.to_le_bytes()).await.unwrap();
            socket.write_all(&0u32.to_le_bytes()).await.unwrap();
            let _ = release_rx.await;
        });

        let lines = Arc::new(LineBuffer::new(4096, Duration::from_millis(100)).unwrap());
        let printer = {
            let lines = Arc::clone(&lines);
            tokio::task::spawn_blocking(move || {
                let printer = RecordPrinter::new(RecordFilter::new("").unwrap(), false);
                output::drain(&lines, &printer, Duration::from_millis(10), &mut ClosedPipe)
            })
        };
        let reader = DbgviewReader::spawn(
            ReaderOptions::new("127.0.0.1").with_port(port),
            Arc::clone(&lines) as Arc<dyn LogSink>,
        );

        let (reason, printed) = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(reader, printer, &lines, std::future::pending()),
        )
        .await
        .expect("supervise hung after the printer failed")
        .unwrap();

        assert_eq!(reason, StopReason::Requested);
        assert_eq!(printed.unwrap_err().kind(), io::ErrorKind::BrokenPipe);

        let _ = release_tx.send(());
        agent.await.unwrap();
    }
}
