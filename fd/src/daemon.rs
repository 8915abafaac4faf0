//! Daemon supervisor - single-instance lifecycle
//!
//! Owns the PID file under the finger home, clears anything holding the
//! configured port, launches the server as a detached child, and after a
//! startup delay registers every module manifest or script found in the
//! autostart directory against the daemon's own registration endpoint.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{autostart_dir, pid_path};

/// Daemon process supervisor
#[derive(Debug)]
pub struct DaemonSupervisor {
    home: PathBuf,
    http_port: u16,
    startup_delay_ms: u64,
}

impl DaemonSupervisor {
    pub fn new(home: impl Into<PathBuf>, http_port: u16, startup_delay_ms: u64) -> Self {
        Self {
            home: home.into(),
            http_port,
            startup_delay_ms,
        }
    }

    fn pid_file(&self) -> PathBuf {
        pid_path(&self.home)
    }

    // === PID file management ===

    fn read_pid(&self) -> Option<u32> {
        let path = self.pid_file();
        if !path.exists() {
            return None;
        }
        let mut contents = String::new();
        fs::File::open(&path).ok()?.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        let path = self.pid_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;
        debug!(pid, path = %path.display(), "wrote pid file");
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<()> {
        let path = self.pid_file();
        if path.exists() {
            fs::remove_file(&path).context("Failed to remove PID file")?;
        }
        Ok(())
    }

    /// Whether a daemon is running (live PID in the PID file)
    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_running)
    }

    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    // === Lifecycle ===

    /// Start the daemon: clear the port, spawn the server child detached,
    /// record its PID, then register autostart modules.
    pub async fn start(&self) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        info!(port = self.http_port, "starting daemon");
        kill_port_holders(self.http_port);
        self.remove_pid_file()?;

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let child = Command::new(&exe)
            .arg("run-server")
            .env("FINGER_HOME", &self.home)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn server process")?;

        let pid = child.id();
        self.write_pid(pid)?;

        tokio::time::sleep(std::time::Duration::from_millis(self.startup_delay_ms)).await;
        self.register_autostart_modules().await;

        info!(pid, "daemon started");
        Ok(pid)
    }

    /// Stop the daemon: SIGTERM, grace period, SIGKILL, remove PID file
    pub fn stop(&self) -> Result<()> {
        let pid = self.running_pid().ok_or_else(|| eyre::eyre!("Daemon is not running"))?;
        info!(pid, "stopping daemon");

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;
        }

        let mut attempts = 0;
        while is_process_running(pid) && attempts < 50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }

        if is_process_running(pid) {
            warn!(pid, "daemon did not stop gracefully, sending SIGKILL");
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        self.remove_pid_file()?;
        info!(pid, "daemon stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<u32> {
        if self.is_running() {
            self.stop()?;
        }
        self.start().await
    }

    /// Record the current process as the daemon (called by the server
    /// process itself once it owns the port).
    pub fn register_self(&self) -> Result<()> {
        self.write_pid(std::process::id())
    }

    /// Scan the autostart directory and register each `*.module.json`
    /// manifest and `*.js` entry script with the daemon's own endpoint.
    pub async fn register_autostart_modules(&self) {
        let dir = autostart_dir(&self.home);
        if !dir.exists() {
            debug!(dir = %dir.display(), "no autostart directory");
            return;
        }

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to read autostart directory");
                return;
            }
        };

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/api/v1/modules/register", self.http_port);

        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("module").to_string();
            let kind = match path.file_name().and_then(|n| n.to_str()) {
                Some(file) if file.ends_with(".module.json") => "manifest",
                Some(file) if file.ends_with(".js") => "script",
                _ => continue,
            };

            debug!(name = %name, kind, "registering autostart module");
            let body = serde_json::json!({
                "name": name,
                "path": path.display().to_string(),
                "kind": kind,
            });
            if let Err(e) = client.post(&url).json(&body).send().await {
                warn!(name = %name, error = %e, "autostart module registration failed");
            }
        }
    }

    /// Human-oriented status snapshot
    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file(),
            http_port: self.http_port,
        }
    }
}

/// Supervisor status report
#[derive(Debug, serde::Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    #[serde(rename = "pidFile")]
    pub pid_file: PathBuf,
    #[serde(rename = "httpPort")]
    pub http_port: u16,
}

/// Check whether a PID is alive (signal 0)
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Kill whatever holds the given TCP port (except ourselves)
fn kill_port_holders(port: u16) {
    let output = Command::new("lsof").args(["-ti", &format!(":{}", port)]).output();
    let Ok(output) = output else {
        debug!(port, "lsof unavailable; skipping port cleanup");
        return;
    };

    let own_pid = std::process::id();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(pid) = line.trim().parse::<u32>() else { continue };
        if pid == own_pid {
            continue;
        }
        warn!(port, pid, "killing process holding daemon port");
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

/// Scan result helper used by status output: autostart entries on disk
pub fn autostart_entries(home: &Path) -> Vec<PathBuf> {
    let dir = autostart_dir(home);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".module.json") || n.ends_with(".js"))
        })
        .collect();
    paths.sort();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_not_running_without_pid_file() {
        let temp = TempDir::new().unwrap();
        let supervisor = DaemonSupervisor::new(temp.path(), 7700, 0);
        assert!(!supervisor.is_running());
        assert!(supervisor.running_pid().is_none());
    }

    #[test]
    fn test_write_read_remove_pid() {
        let temp = TempDir::new().unwrap();
        let supervisor = DaemonSupervisor::new(temp.path(), 7700, 0);

        supervisor.write_pid(12345).unwrap();
        assert_eq!(supervisor.read_pid(), Some(12345));

        supervisor.remove_pid_file().unwrap();
        assert_eq!(supervisor.read_pid(), None);
    }

    #[test]
    fn test_register_self_records_live_pid() {
        let temp = TempDir::new().unwrap();
        let supervisor = DaemonSupervisor::new(temp.path(), 7700, 0);

        supervisor.register_self().unwrap();
        // Our own PID is alive, so the daemon reports running.
        assert!(supervisor.is_running());
        assert_eq!(supervisor.running_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_stale_pid_not_running() {
        let temp = TempDir::new().unwrap();
        let supervisor = DaemonSupervisor::new(temp.path(), 7700, 0);

        // A PID that cannot exist on Linux (beyond pid_max).
        supervisor.write_pid(4_194_305).unwrap();
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_status_snapshot() {
        let temp = TempDir::new().unwrap();
        let supervisor = DaemonSupervisor::new(temp.path(), 7812, 0);
        let status = supervisor.status();
        assert!(!status.running);
        assert_eq!(status.http_port, 7812);
        assert_eq!(status.pid_file, temp.path().join("daemon.pid"));
    }

    #[test]
    fn test_autostart_entries_filters_extensions() {
        let temp = TempDir::new().unwrap();
        let dir = autostart_dir(temp.path());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("alpha.module.json"), "{}").unwrap();
        fs::write(dir.join("beta.js"), "// entry").unwrap();
        fs::write(dir.join("notes.txt"), "ignore me").unwrap();

        let entries = autostart_entries(temp.path());
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("alpha.module.json"));
        assert!(entries[1].ends_with("beta.js"));
    }

    #[test]
    fn test_stop_without_daemon_errors() {
        let temp = TempDir::new().unwrap();
        let supervisor = DaemonSupervisor::new(temp.path(), 7700, 0);
        assert!(supervisor.stop().is_err());
    }
}
