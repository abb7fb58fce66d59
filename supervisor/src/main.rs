//! Main entry point for the supervisor binary
//!
//! Demonstrates embedding the supervisor in a host: spawn one worker for the
//! given script, tail its log queue, and shut everything down on completion
//! or Ctrl-C.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use tokio::signal;

use shared::{logging, LogLevel};
use supervisor::{SupervisorConfig, WorkerSupervisor};

/// Supervisor for external interpreter worker processes
#[derive(Parser)]
#[command(name = "supervisor")]
#[command(about = "Launches and supervises an interpreter worker process")]
struct Args {
    /// Path to the user script the worker should run
    #[arg(long)]
    script: String,

    /// Interpreter executable used to launch the worker
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Bootstrap program handed to the interpreter
    #[arg(long, default_value = "bootstrap.py")]
    bootstrap: String,

    /// Script arguments as key=value pairs (repeatable)
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Worker memory limit in MiB
    #[arg(long, default_value = "512")]
    memory_limit_mb: u32,

    /// Worker CPU limit in percent
    #[arg(long, default_value = "80.0")]
    cpu_limit_percent: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init_tracing_with_level(Some(&args.log_level));

    let mut script_args = HashMap::new();
    for pair in &args.args {
        match pair.split_once('=') {
            Some((key, value)) => {
                script_args.insert(key.to_string(), value.to_string());
            }
            None => {
                return Err(format!("--arg must be key=value, got '{}'", pair).into());
            }
        }
    }

    let mut config = SupervisorConfig::new(&args.interpreter, &args.bootstrap);
    config.memory_limit_mb = args.memory_limit_mb;
    config.cpu_limit_percent = args.cpu_limit_percent;
    config.log_level = args
        .log_level
        .parse::<LogLevel>()
        .unwrap_or(LogLevel::Info);

    let supervisor = WorkerSupervisor::new(config);

    tracing::info!("🚀 Starting worker for script: {}", args.script);
    let worker = supervisor.create(&args.script, &script_args).await?;
    let log_stream = supervisor
        .log_stream(worker)
        .await
        .ok_or("log collection did not start")?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("🛑 Ctrl-C received, terminating worker {}", worker);
                if let Err(e) = supervisor.terminate(worker, Duration::from_secs(5)).await {
                    tracing::warn!("Failed to terminate worker {}: {}", worker, e);
                }
                break;
            }
            record = log_stream.next(Duration::from_millis(500)) => {
                if let Some(record) = record {
                    println!(
                        "[{}] [{}] {} {}",
                        record.timestamp.format("%H:%M:%S%.3f"),
                        record.source,
                        record.level,
                        record.message
                    );
                    continue;
                }
                let status = supervisor.status(worker).await;
                if status.is_terminal() {
                    tracing::info!("Worker {} finished with status {}", worker, status);
                    break;
                }
            }
        }
    }

    // Drain whatever the pumps collected after the worker exited.
    for record in log_stream.drain().await {
        println!(
            "[{}] [{}] {} {}",
            record.timestamp.format("%H:%M:%S%.3f"),
            record.source,
            record.level,
            record.message
        );
    }

    if let Some(metrics) = supervisor.metrics(worker).await {
        tracing::info!(
            "Worker {} used {} ms CPU, peak {} bytes resident",
            worker,
            metrics.cpu_time_ms,
            metrics.peak_memory_bytes
        );
    }

    supervisor.shutdown().await;
    Ok(())
}
