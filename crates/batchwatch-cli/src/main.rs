use anyhow::{bail, Context, Result};
use batchwatch_client::config::resolve_base_url;
use batchwatch_client::connection::EventReceiver;
use batchwatch_client::{
    spawn_board_feed, ClientConfig, ConnectionManager, ConnectionState, ControlClient, TaskBoard,
};
use batchwatch_core::wire::ServerEvent;
use batchwatch_core::{TaskRecord, DEFAULT_COMPLETION_MESSAGE};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const SESSION_WAIT: Duration = Duration::from_secs(10);
const SETTLE_POLL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "batchwatch-cli")]
struct Args {
    /// Base URL of the processing service (env: BATCHWATCH_BASE_URL)
    #[arg(long, default_value = "")]
    base_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print task updates as they stream in
    Watch,
    /// Upload files, then stream progress until every task settles
    Upload {
        files: Vec<PathBuf>,
        /// Request bulk cancellation before exiting on ctrl-c
        #[arg(long, default_value_t = false)]
        cancel_on_interrupt: bool,
        /// Where to store the aggregated error report if any task fails
        #[arg(long, default_value = "error-report.xlsx")]
        error_report: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = ClientConfig::new(&resolve_base_url(&args.base_url))?;
    let manager = ConnectionManager::new(config.ws_url.clone(), config.reconnect);
    let board = TaskBoard::new();

    let outcome = match args.command {
        Command::Watch => run_watch(&manager).await,
        Command::Upload {
            files,
            cancel_on_interrupt,
            error_report,
        } => {
            run_upload(
                &manager,
                &board,
                &config,
                files,
                cancel_on_interrupt,
                &error_report,
            )
            .await
        }
    };

    // The composition root owns the connection lifecycle; nothing else may
    // call disconnect.
    manager.disconnect().await;
    outcome
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Pure observer: nothing is submitted here, so no task table is seeded.
/// Prints the event stream and the connectivity indicator.
async fn run_watch(manager: &ConnectionManager) -> Result<()> {
    let mut events = manager.add_listener("printer");
    let mut states = manager.state_watch();
    manager.connect().await.context("initial connect failed")?;
    println!("watching for task updates (ctrl-c to quit)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("connection: {}", state_label(*states.borrow_and_update()));
            }
            maybe = events.recv() => {
                match maybe {
                    Some(event) => {
                        if let Some(line) = event_line(&event) {
                            println!("{line}");
                        }
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

async fn run_upload(
    manager: &ConnectionManager,
    board: &TaskBoard,
    config: &ClientConfig,
    files: Vec<PathBuf>,
    cancel_on_interrupt: bool,
    error_report: &Path,
) -> Result<()> {
    if files.is_empty() {
        bail!("no files to upload");
    }

    let _feed = spawn_board_feed(manager, board.clone());
    let mut events = manager.add_listener("printer");
    manager.connect().await.context("connect failed")?;

    let session_id = wait_for_session(manager, &mut events).await?;
    println!("session established: {session_id}");

    let control = ControlClient::new(&config.base_url);
    let seeds = control
        .submit_files(&session_id, &files)
        .await
        .context("submission failed")?;
    if seeds.is_empty() {
        bail!("service accepted the upload but assigned no tasks");
    }
    board.init_tasks(&seeds);
    println!("submitted {} file(s), tracking progress", seeds.len());

    match stream_until_settled(manager, board, &mut events).await {
        Outcome::Settled => {
            println!("all tasks settled:");
            for task in board.tasks() {
                println!("  {}", task_line(&task));
            }
            if board.has_errors() {
                control
                    .download_error_report(error_report)
                    .await
                    .context("error report download failed")?;
                println!("error report saved to {}", error_report.display());
            }
            Ok(())
        }
        Outcome::Interrupted => {
            if cancel_on_interrupt {
                if let Err(err) = control.cancel_all().await {
                    warn!("bulk cancel failed: {err}");
                } else {
                    println!("bulk cancellation requested");
                }
            }
            Ok(())
        }
        Outcome::GaveUp => {
            bail!("connection lost and reconnect attempts exhausted; task progress is unknown")
        }
    }
}

enum Outcome {
    Settled,
    Interrupted,
    GaveUp,
}

/// The identity frame may already have been consumed by the connection
/// layer before our listener registered, so check the captured value first.
async fn wait_for_session(
    manager: &ConnectionManager,
    events: &mut EventReceiver,
) -> Result<String> {
    if let Some(session_id) = manager.session_id() {
        return Ok(session_id);
    }
    let waited = tokio::time::timeout(SESSION_WAIT, async {
        while let Some(event) = events.recv().await {
            if let ServerEvent::Identity(frame) = event {
                return Some(frame.session_id);
            }
        }
        None
    })
    .await;
    match waited {
        Ok(Some(session_id)) => Ok(session_id),
        _ => bail!("server did not provide a session identity"),
    }
}

async fn stream_until_settled(
    manager: &ConnectionManager,
    board: &TaskBoard,
    events: &mut EventReceiver,
) -> Outcome {
    let mut states = manager.state_watch();
    // The board is fed on a separate listener and may lag the frame we just
    // printed; settlement is polled on a ticker.
    let mut ticker = tokio::time::interval(SETTLE_POLL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Outcome::Interrupted,
            _ = ticker.tick() => {
                if board.all_settled() {
                    return Outcome::Settled;
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return Outcome::Interrupted;
                }
                let state = *states.borrow_and_update();
                println!("connection: {}", state_label(state));
                if state == ConnectionState::GaveUp {
                    return Outcome::GaveUp;
                }
            }
            maybe = events.recv() => {
                match maybe {
                    Some(event) => {
                        if let Some(line) = event_line(&event) {
                            println!("{line}");
                        }
                    }
                    None => return Outcome::Interrupted,
                }
            }
        }
    }
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::GaveUp => "disconnected (gave up; restart to retry)",
    }
}

fn event_line(event: &ServerEvent) -> Option<String> {
    match event {
        ServerEvent::Identity(_) => None,
        ServerEvent::Processing(frame) => {
            let progress = frame
                .progress
                .map(|value| format!("{value}% "))
                .unwrap_or_default();
            let message = frame
                .message
                .as_deref()
                .map(|text| format!(" - {text}"))
                .unwrap_or_default();
            Some(format!(
                "{} [{}] {}processing{}",
                frame.file_name, frame.task_id, progress, message
            ))
        }
        ServerEvent::Completed(frame) => Some(format!(
            "{} [{}] completed - {}",
            frame.file_name,
            frame.task_id,
            frame.message.as_deref().unwrap_or(DEFAULT_COMPLETION_MESSAGE)
        )),
        ServerEvent::Error(frame) => Some(format!(
            "{} [{}] error - {}",
            frame.file_name,
            frame.task_id,
            frame.message.as_deref().unwrap_or("unknown error")
        )),
        ServerEvent::Cancelled(frame) => Some(format!(
            "{} [{}] cancelled",
            frame.file_name, frame.task_id
        )),
    }
}

fn task_line(task: &TaskRecord) -> String {
    let message = task
        .message
        .as_deref()
        .map(|text| format!(" - {text}"))
        .unwrap_or_default();
    format!(
        "{} [{}] {}% {}{}",
        task.file_name, task.task_id, task.progress, task.status, message
    )
}
