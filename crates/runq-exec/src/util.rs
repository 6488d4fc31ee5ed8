use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::trace;

pub fn cmd_program(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(|s| s.as_str()));
    cmd
}

/// Command line running `script` through the platform shell (`sh -c` / `cmd /C`).
pub fn shell_command(script: impl Into<String>) -> Vec<String> {
    cfg_if::cfg_if! {
        if #[cfg(target_family = "windows")] {
            vec!["cmd".into(), "/C".into(), script.into()]
        } else {
            vec!["sh".into(), "-c".into(), script.into()]
        }
    }
}

/// Ask the child to stop with SIGTERM, then SIGKILL it if it is still alive
/// after `grace`. Always reaps the child.
#[cfg(target_family = "unix")]
pub async fn kill_graceful(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if let Some(id) = child.id()
        && let Ok(pid) = libc::pid_t::try_from(id)
    {
        // SAFETY: plain syscall on a pid we spawned and have not reaped yet.
        let _ = unsafe { libc::kill(pid, libc::SIGTERM) };
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            trace!(target: "runq.exec.kill", ?status, "exited after SIGTERM");
            Ok(())
        }
        Err(_) => {
            trace!(target: "runq.exec.kill", "grace period elapsed; killing");
            child.kill().await
        }
    }
}

#[cfg(target_family = "windows")]
pub async fn kill_graceful(child: &mut Child, _grace: Duration) -> std::io::Result<()> {
    child.kill().await
}
