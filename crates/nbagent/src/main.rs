//! nbagent CLI entry point.
//!
//! Serves tool calls over stdio as line-delimited JSON: one request per line,
//! `{"tool": "...", "arguments": {...}}`, one JSON response per line. Wire
//! framings beyond that (HTTP, SSE) wrap this same invoke-by-name seam.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use nbagent::backend::ServerContext;
use nbagent::config::Config;
use nbagent::tools::Toolbox;

#[derive(Parser, Debug)]
#[command(name = "nbagent")]
#[command(about = "Agent-facing tool server for Jupyter notebooks")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve tool calls over stdio (default if no command specified)
    Serve {
        /// Base URL of the server hosting documents
        #[arg(long, env = "NBAGENT_DOCUMENT_URL", default_value = "http://localhost:8888")]
        document_url: String,

        /// Authentication token for the document server
        #[arg(long, env = "NBAGENT_DOCUMENT_TOKEN")]
        document_token: Option<String>,

        /// Base URL of the server hosting kernels
        #[arg(long, env = "NBAGENT_RUNTIME_URL", default_value = "http://localhost:8888")]
        runtime_url: String,

        /// Authentication token for the runtime server
        #[arg(long, env = "NBAGENT_RUNTIME_TOKEN")]
        runtime_token: Option<String>,

        /// Default notebook path for tools invoked without a connected session
        #[arg(long, env = "NBAGENT_DOCUMENT_ID", default_value = "notebook.ipynb")]
        document_id: String,

        /// Kernelspec name for newly started kernels
        #[arg(long, default_value = "python3")]
        kernel_name: String,

        /// Run embedded: use in-process managers rooted at this directory
        /// instead of the networked APIs
        #[arg(long)]
        root_dir: Option<PathBuf>,

        /// Return image outputs as payloads instead of text placeholders
        #[arg(long, default_value_t = true)]
        allow_img_output: bool,

        /// Default execution timeout in seconds
        #[arg(long, default_value_t = nbagent::config::DEFAULT_EXECUTE_TIMEOUT_SECS)]
        execute_timeout: u64,
    },

    /// List tool names and their argument schemas as JSON
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Some(Commands::Tools) => {
            let schemas: Vec<Value> = Toolbox::schemas()
                .into_iter()
                .map(|(name, schema)| json!({"name": name, "input_schema": schema}))
                .collect();
            println!("{}", serde_json::to_string_pretty(&schemas)?);
            Ok(())
        }
        None | Some(Commands::Serve { .. }) => {
            let config = match cli.command {
                Some(Commands::Serve {
                    document_url,
                    document_token,
                    runtime_url,
                    runtime_token,
                    document_id,
                    kernel_name,
                    root_dir,
                    allow_img_output,
                    execute_timeout,
                }) => Config {
                    document_url,
                    document_token,
                    runtime_url,
                    runtime_token,
                    document_id,
                    kernel_name,
                    root_dir,
                    allow_img_output,
                    execute_timeout: Duration::from_secs(execute_timeout),
                    ..Config::default()
                },
                _ => Config::default(),
            };

            let ctx = if config.root_dir.is_some() {
                ServerContext::embedded_in_process(config)
            } else {
                ServerContext::networked(config)
            };
            info!("[main] Starting nbagent in {} mode", ctx.mode());

            serve(Toolbox::new(Arc::new(ctx))).await
        }
    }
}

/// Read requests from stdin, one JSON object per line, and answer each with a
/// single JSON line on stdout.
async fn serve(toolbox: Toolbox) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = std::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => {
                let tool = request
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = request
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                match toolbox.invoke(&tool, arguments).await {
                    Ok(output) => json!({"success": true, "result": output}),
                    Err(err) => json!({"success": false, "error": err.payload()}),
                }
            }
            Err(e) => json!({
                "success": false,
                "error": {"kind": "internal", "message": format!("invalid request: {e}")},
            }),
        };

        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }

    info!("[main] stdin closed, shutting down");
    Ok(())
}
