//! Orphan reaping
//!
//! Every sandboxed child carries a marker environment variable. If the
//! engine dies mid-execution, the replacement process calls
//! [`reap_orphans`] on startup to kill any marked survivor instead of
//! leaving integration code running unsupervised.

#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use tracing::{info, warn};

/// Marker variable stamped into every sandboxed child's environment
pub const SANDBOX_MARKER: &str = "GANGWAY_SANDBOX";

/// Kill surviving sandboxed children from a previous engine incarnation
///
/// Scans `/proc` for processes carrying the sandbox marker and sends them
/// SIGKILL. Returns the number of processes reaped. Unreadable entries
/// (races, permissions) are skipped.
#[cfg(target_os = "linux")]
pub fn reap_orphans() -> usize {
    let own_pid = std::process::id();
    let mut reaped = 0;

    let Ok(entries) = fs::read_dir("/proc") else {
        warn!("cannot read /proc; orphan reaping skipped");
        return 0;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        let environ_path = format!("/proc/{}/environ", pid);
        let Ok(environ) = fs::read(&environ_path) else {
            continue;
        };

        let marker = format!("{}=", SANDBOX_MARKER);
        let marked = environ
            .split(|b| *b == 0)
            .any(|var| var.starts_with(marker.as_bytes()));
        if !marked {
            continue;
        }

        // SAFETY: plain SIGKILL to a pid we just identified; a stale pid
        // at worst returns ESRCH
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            info!(pid, "reaped orphaned sandbox child");
            reaped += 1;
        }
    }

    reaped
}

/// No `/proc` to scan off Linux; nothing to reap.
#[cfg(not(target_os = "linux"))]
pub fn reap_orphans() -> usize {
    0
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::sync::Mutex;
    use std::time::Duration;

    // Reaping is process-global; the tests must not interleave
    static REAPER_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_reaps_marked_process() {
        let _guard = REAPER_LOCK.lock().unwrap();
        let mut child = Command::new("sleep")
            .arg("30")
            .env(SANDBOX_MARKER, "1")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn marked sleeper");
        let pid = child.id();

        // Give /proc a moment to expose the environ
        std::thread::sleep(Duration::from_millis(50));

        let reaped = reap_orphans();
        assert!(reaped >= 1, "expected at least the marked sleeper");

        let status = child.wait().expect("collect sleeper");
        assert!(!status.success());
        let _ = pid;
    }

    #[test]
    fn test_ignores_unmarked_processes() {
        let _guard = REAPER_LOCK.lock().unwrap();
        let mut child = Command::new("sleep")
            .arg("2")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn unmarked sleeper");

        std::thread::sleep(Duration::from_millis(50));
        reap_orphans();

        // Still alive: kill(pid, 0) probes existence
        let alive = unsafe { libc::kill(child.id() as libc::pid_t, 0) } == 0;
        assert!(alive, "unmarked process must survive reaping");
        let _ = child.kill();
        let _ = child.wait();
    }
}
