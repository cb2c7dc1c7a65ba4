use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use relay_store::ListQuery;
use relayd::{heartbeat, load_config, RunRequest, Runner, RunnerError, END_USER_HEADER};
use serde_json::json;

#[derive(Parser)]
#[command(name = "relayd")]
#[command(about = "Resumable agent runtime", long_about = None)]
struct Cli {
    /// Config file (JSON or JSONC). Defaults to RELAY_CONFIG, then relay.json(c) in the working dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP/SSE API (default).
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
    /// Run one turn to completion and print the final state as JSON.
    Run {
        message: String,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        end_user: Option<String>,
    },
    /// Run one turn and print every frame in SSE wire format.
    Stream {
        message: String,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        end_user: Option<String>,
    },
    /// List a thread's checkpoints, newest first.
    History {
        thread: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    relayd::init_tracing();

    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let config = load_config(cli.config.as_deref(), &cwd)?;
    let runner = Arc::new(Runner::from_config(&config).await?);

    match cli.command.unwrap_or(Commands::Serve { addr: None }) {
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.addr());
            relayd::serve(runner, &addr).await?;
        }
        Commands::Run {
            message,
            thread,
            end_user,
        } => {
            let request = request(message, thread, end_user);
            let result = runner
                .scope(|runner| async move { runner.run(request).await })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Stream {
            message,
            thread,
            end_user,
        } => {
            let request = request(message, thread, end_user);
            runner
                .scope(|runner| async move {
                    let events = runner.stream(request)?;
                    let mut frames = Box::pin(heartbeat(events, runner.heartbeat_interval()));
                    let mut stdout = std::io::stdout();
                    while let Some(frame) = frames.next().await {
                        stdout
                            .write_all(frame.encode().as_bytes())
                            .and_then(|()| stdout.flush())
                            .map_err(|err| RunnerError::Internal(err.to_string()))?;
                    }
                    Ok(())
                })
                .await?;
        }
        Commands::History { thread, limit } => {
            let history = runner
                .scope(|runner| async move {
                    runner.history(&thread, ListQuery::default().limit(limit)).await
                })
                .await?;
            for tuple in history {
                let line = json!({
                    "checkpoint_id": tuple.checkpoint.id,
                    "step": tuple.metadata.step,
                    "source": tuple.metadata.source,
                    "next": tuple.metadata.next,
                    "messages": tuple.checkpoint.messages().len(),
                });
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn request(message: String, thread: Option<String>, end_user: Option<String>) -> RunRequest {
    let mut request = RunRequest::new(message);
    request.thread_id = thread;
    if let Some(end_user) = end_user {
        request = request.with_header(END_USER_HEADER, end_user);
    }
    request
}
