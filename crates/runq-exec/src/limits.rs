//! POSIX rlimits applied to every process a supervisor spawns.
//!
//! On Unix the limits are set inside a `pre_exec` hook, in the child after
//! `fork()` and before `execve()`, so the step never runs unrestricted.
//! Elsewhere a non-empty config is logged and ignored.
use tokio::process::Command;
#[cfg(not(unix))]
use tracing::warn;

/// Limits for a step's process. `None` leaves the inherited limit in place.
#[derive(Debug, Clone, Default)]
pub struct RlimitConfig {
    /// `RLIMIT_NOFILE`.
    pub max_open_files: Option<u64>,

    /// `RLIMIT_FSIZE`; growing a file past it usually ends the process with `SIGXFSZ`.
    pub max_file_size_bytes: Option<u64>,

    /// `RLIMIT_CPU`, in seconds.
    pub max_cpu_seconds: Option<u64>,

    /// `RLIMIT_CORE = 0` when set.
    pub disable_core_dumps: bool,
}

impl RlimitConfig {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_open_files.is_none()
            && self.max_file_size_bytes.is_none()
            && self.max_cpu_seconds.is_none()
            && !self.disable_core_dumps
    }
}

/// Install `config` on `cmd`. No-op for an empty config.
pub fn attach_rlimits(cmd: &mut Command, config: &RlimitConfig) {
    if config.is_empty() {
        return;
    }

    #[cfg(unix)]
    {
        unix_impl::attach_rlimits(cmd, config);
    }

    #[cfg(not(unix))]
    {
        let _ = cmd;
        warn!(
            target: "runq.exec.limits",
            ?config,
            "rlimits requested on a non-Unix OS; ignored"
        );
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::io;

    use tokio::process::Command;

    use super::RlimitConfig;

    pub fn attach_rlimits(cmd: &mut Command, config: &RlimitConfig) {
        let limits: Vec<(libc::c_int, u64)> = [
            (libc::RLIMIT_NOFILE as libc::c_int, config.max_open_files),
            (libc::RLIMIT_FSIZE as libc::c_int, config.max_file_size_bytes),
            (libc::RLIMIT_CPU as libc::c_int, config.max_cpu_seconds),
            (
                libc::RLIMIT_CORE as libc::c_int,
                config.disable_core_dumps.then_some(0),
            ),
        ]
        .into_iter()
        .filter_map(|(res, v)| v.map(|v| (res, v)))
        .collect();

        // SAFETY: the hook only calls setrlimit, which is async-signal-safe,
        // and does not allocate.
        unsafe {
            cmd.pre_exec(move || {
                for &(resource, value) in &limits {
                    apply_rlimit(resource, value)?;
                }
                Ok(())
            });
        }
    }

    fn apply_rlimit(resource: libc::c_int, value: u64) -> io::Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };

        // The resource type differs between libc targets (c_int vs c_uint).
        #[allow(clippy::unnecessary_cast)]
        let rc = unsafe { libc::setrlimit(resource as _, &rlim) };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        let config = RlimitConfig::default();
        assert!(config.is_empty());
        assert!(
            !RlimitConfig {
                disable_core_dumps: true,
                ..Default::default()
            }
            .is_empty()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn open_files_limit_reaches_the_child() {
        let config = RlimitConfig {
            max_open_files: Some(64),
            ..Default::default()
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("ulimit -n");
        attach_rlimits(&mut cmd, &config);

        let out = cmd.output().await.unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "64");
    }
}
