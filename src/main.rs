mod comm;
mod sandbox;

use comm::{Comm, CommConfig, ExecutionJob, ResponsePayload};
use sandbox::{ExecutionReport, Sandbox, SandboxConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{Level, error, info, warn};
use tracing_subscriber::fmt;

/// Tokio runtime with signal handling
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_max_level(log_level())
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting pybox daemon...");

    let sandbox_config = SandboxConfig::load()?;
    let comm_config = CommConfig::from_env();

    info!(
        comm_port = comm_config.listen_port,
        interpreter = %sandbox_config.interpreter,
        default_timeout_secs = sandbox_config.default_timeout_secs,
        max_timeout_secs = sandbox_config.max_timeout_secs,
        "Configuration loaded"
    );

    let (comm, mut job_rx) = Comm::new(comm_config).await?;
    info!(addr = %comm.local_addr()?, "Comm initialized");

    let sandbox = Arc::new(Sandbox::new(sandbox_config));

    let comm_handle = tokio::spawn(async move {
        if let Err(e) = comm.run().await {
            error!(error = %e, "Comm server error");
        }
    });

    info!("Entering main loop...");

    loop {
        tokio::select! {
            job = job_rx.recv() => {
                let Some(job) = job else {
                    warn!("Comm channel closed");
                    break;
                };
                let sandbox = Arc::clone(&sandbox);
                tokio::spawn(async move {
                    dispatch(&sandbox, job).await;
                });
            }
            _ = async {
                signal::ctrl_c().await.ok();
            } => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Shutting down...");
    comm_handle.abort();

    info!("Goodbye!");
    Ok(())
}

/// Max log level from `PYBOX_LOG`, `info` when unset or invalid
fn log_level() -> Level {
    std::env::var("PYBOX_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(Level::INFO)
}

/// Run one job through the sandbox and hand the result back to comm
async fn dispatch(sandbox: &Sandbox, job: ExecutionJob) {
    let ExecutionJob {
        payload,
        reply,
        source_addr,
    } = job;

    let response = match sandbox.prepare(
        payload.user_code,
        payload.test_code,
        payload.timeout,
        payload.language.as_deref(),
    ) {
        Ok(request) => to_response(sandbox.execute(request).await),
        Err(e) => {
            warn!(client = %source_addr, error = %e, "Rejected request");
            to_response(ExecutionReport::rejected(e.to_string()))
        }
    };

    info!(client = %source_addr, status = %response.status, "Execution finished");
    if reply.send(response).is_err() {
        warn!(client = %source_addr, "Comm dropped the reply channel");
    }
}

fn to_response(report: ExecutionReport) -> ResponsePayload {
    ResponsePayload {
        stdout: report.combined_output,
        stderr: report.combined_stderr,
        returncode: report.returncode,
        error: report.combined_error,
        linter_output: report.lint_output,
        status: report.verdict.as_str().to_string(),
    }
}
