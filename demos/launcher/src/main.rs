use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use runq_core::{Launcher, LauncherConfig, RunState};
use runq_exec::{ProcessSupervisor, SupervisorConfig, shell_command};
use runq_observe::{LoggerConfig, LoggingListener, logger_init};

const APP: &str = "demo";

/// Runs every argument as one shell step of a single job:
///
/// ```text
/// launcher 'echo building' 'false' 'echo never printed'
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let scripts: Vec<String> = std::env::args().skip(1).collect();
    if scripts.is_empty() {
        bail!("usage: launcher <script> [<script>...]");
    }

    // 1) Logger
    logger_init(&LoggerConfig::from_env()?)?;

    // 2) Launcher over the process supervisor
    let launcher = Launcher::new(
        LauncherConfig::default(),
        Arc::new(ProcessSupervisor::new(SupervisorConfig::default())),
    );
    launcher.register_listener(APP, Arc::new(LoggingListener::new().stop_on_failure(true)));

    // 3) One job, one step per script
    let cwd = std::env::current_dir().context("current dir")?;
    let owner = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
    let job = launcher.prepare_root_job(APP, owner, cwd, None);
    for (i, script) in scripts.iter().enumerate() {
        launcher.prepare_step(&job, format!("step-{i}"), shell_command(script.as_str()))?;
    }
    launcher.submit(&job)?;
    info!(id = job.id(), steps = job.step_count(), "job submitted");

    // 4) Wait for the job, or stop everything on Ctrl+C
    tokio::select! {
        _ = job.completed() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; shutting down");
            launcher.shutdown();
            job.completed().await;
        }
    }

    let header = format!("== {} [{}] ==", job.name(), job.state());
    println!("{}", job.buffer().snapshot(Some(&header)));

    if job.state() != RunState::FinishedOk {
        bail!("job ended as {}", job.state());
    }
    Ok(())
}
