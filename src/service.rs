//! Lifecycle supervisor for the local embedding inference service.
//!
//! The service is a Python process speaking HTTP on a loopback port
//! (`GET /healthz`, `POST /embed`). The supervisor owns everything about
//! it: environment preparation, startup, health polling, status
//! transitions, and shutdown. Other components never touch the process;
//! they observe status through a watch channel.
//!
//! # State machine
//!
//! ```text
//! NotStarted → Starting → Ready ⇄ Indexing
//!                  │
//!                  └──→ Failed ──(caller-initiated start)──→ Starting
//! ```
//!
//! `start()` is idempotent: concurrent callers await the same in-flight
//! startup and observe the same eventual outcome instead of spawning
//! duplicate processes.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::config::ServiceConfig;
use crate::retry::RetryPolicy;

/// Lifecycle states of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    NotStarted,
    Starting,
    Ready,
    Indexing,
    Failed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::NotStarted => "not started",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Indexing => "indexing",
            ServiceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Observable runtime state of the service.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub status: ServiceStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// Set when the process was marked ready despite failing health
    /// checks (see [`ServiceSupervisor::start`]).
    pub degraded: bool,
}

impl ServiceState {
    fn initial() -> Self {
        Self {
            status: ServiceStatus::NotStarted,
            port: None,
            pid: None,
            degraded: false,
        }
    }

    /// Base URL of the running service, when one is bound.
    pub fn base_url(&self) -> Option<String> {
        self.port.map(|p| format!("http://127.0.0.1:{}", p))
    }
}

struct Inner {
    child: Option<tokio::process::Child>,
}

/// Owns the inference process. See module docs for the state machine.
pub struct ServiceSupervisor {
    config: ServiceConfig,
    state_tx: watch::Sender<ServiceState>,
    inner: Mutex<Inner>,
    http: reqwest::Client,
}

impl ServiceSupervisor {
    pub fn new(config: ServiceConfig) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::initial());
        Self {
            config,
            state_tx,
            inner: Mutex::new(Inner { child: None }),
            http: reqwest::Client::new(),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> ServiceState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    /// Start the service if it is not already running.
    ///
    /// Exactly one caller performs the startup; everyone else awaits the
    /// in-flight attempt through the watch channel and shares its
    /// outcome. A fresh call after a `Failed` outcome retries from
    /// scratch (restart is caller-initiated, never automatic).
    pub async fn start(&self) -> Result<ServiceState> {
        let mut rx = self.state_tx.subscribe();
        let mut awaited_inflight = false;

        loop {
            let current = rx.borrow_and_update().clone();
            match current.status {
                ServiceStatus::Ready | ServiceStatus::Indexing => return Ok(current),
                ServiceStatus::Failed if awaited_inflight => {
                    bail!("embedding service failed to start");
                }
                ServiceStatus::Starting => {
                    awaited_inflight = true;
                    rx.changed()
                        .await
                        .context("supervisor dropped while starting")?;
                }
                ServiceStatus::NotStarted | ServiceStatus::Failed => {
                    let mut inner = self.inner.lock().await;
                    // Re-check: another caller may have raced us here.
                    let status = self.state().status;
                    if !matches!(status, ServiceStatus::NotStarted | ServiceStatus::Failed) {
                        continue;
                    }

                    self.state_tx.send_modify(|s| {
                        s.status = ServiceStatus::Starting;
                        s.degraded = false;
                    });

                    match self.spawn_and_wait(&mut inner).await {
                        Ok(state) => return Ok(state),
                        Err(e) => {
                            if let Some(mut child) = inner.child.take() {
                                let _ = child.kill().await;
                            }
                            self.state_tx.send_modify(|s| {
                                s.status = ServiceStatus::Failed;
                                s.port = None;
                                s.pid = None;
                            });
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn spawn_and_wait(&self, inner: &mut Inner) -> Result<ServiceState> {
        let port = match self.config.port {
            Some(p) => p,
            None => pick_free_port()?,
        };

        let python = if self.config.manage_env {
            self.prepare_environment().await?
        } else {
            PathBuf::from(&self.config.python_bin)
        };

        if !self.config.script.exists() {
            bail!(
                "Inference service script not found: {}",
                self.config.script.display()
            );
        }

        // Port and credentials travel via the environment, never argv.
        let child = tokio::process::Command::new(&python)
            .arg(&self.config.script)
            .env("QUARRY_SERVICE_PORT", port.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn inference service: {}", python.display()))?;

        let pid = child.id();
        inner.child = Some(child);
        self.state_tx.send_modify(|s| {
            s.port = Some(port);
            s.pid = pid;
        });

        if let Some(pid) = pid {
            if let Err(e) = write_handle(&self.config.state_dir, &PersistedHandle { port, pid }) {
                eprintln!("Warning: could not persist service handle: {}", e);
            }
        }

        let health_url = format!("http://127.0.0.1:{}/healthz", port);
        let policy = RetryPolicy::fixed(
            self.config.health_attempts,
            Duration::from_secs(self.config.health_interval_secs),
        );

        let healthy = policy
            .run(|_| {
                let url = health_url.clone();
                let http = self.http.clone();
                async move {
                    let resp = http
                        .get(&url)
                        .timeout(Duration::from_secs(5))
                        .send()
                        .await?;
                    if resp.status().is_success() {
                        Ok(())
                    } else {
                        bail!("health check returned {}", resp.status())
                    }
                }
            })
            .await;

        let degraded = match healthy {
            Ok(()) => false,
            Err(e) => {
                let exited = match inner.child.as_mut() {
                    Some(child) => child.try_wait()?.is_some(),
                    None => true,
                };
                if exited {
                    bail!("Inference service exited during startup: {}", e);
                }
                // The process is alive but never answered /healthz; a
                // misconfigured health endpoint is more likely than a
                // dead service, so proceed and let the first embed call
                // decide.
                eprintln!(
                    "Warning: inference service on port {} never passed its health check; \
                     continuing in degraded mode",
                    port
                );
                true
            }
        };

        self.state_tx.send_modify(|s| {
            s.status = ServiceStatus::Ready;
            s.degraded = degraded;
        });
        Ok(self.state())
    }

    /// Create the virtual environment if absent and make sure the
    /// service's dependencies import; install them only when the probe
    /// fails. Returns the venv's Python executable.
    async fn prepare_environment(&self) -> Result<PathBuf> {
        let venv_dir = self.config.state_dir.join("venv");
        let python = venv_python(&venv_dir);

        if !python.exists() {
            std::fs::create_dir_all(&self.config.state_dir)?;
            let status = tokio::process::Command::new(&self.config.python_bin)
                .args(["-m", "venv"])
                .arg(&venv_dir)
                .status()
                .await
                .with_context(|| format!("Failed to run {} -m venv", self.config.python_bin))?;
            if !status.success() {
                bail!("venv creation failed with {}", status);
            }
        }

        let probe = tokio::process::Command::new(&python)
            .args(["-c", "import fastapi, uvicorn"])
            .status()
            .await?;

        if !probe.success() {
            let mut cmd = tokio::process::Command::new(&python);
            cmd.args(["-m", "pip", "install", "--quiet"]);
            match &self.config.requirements {
                Some(req) => {
                    cmd.arg("-r").arg(req);
                }
                None => {
                    cmd.args(["fastapi", "uvicorn", "pydantic"]);
                }
            }
            let status = cmd.status().await.context("Failed to run pip install")?;
            if !status.success() {
                bail!("dependency install failed with {}", status);
            }
        }

        Ok(python)
    }

    /// Mark the service busy with a batch run. No-op unless `Ready`.
    pub fn mark_indexing(&self) {
        self.state_tx.send_modify(|s| {
            if s.status == ServiceStatus::Ready {
                s.status = ServiceStatus::Indexing;
            }
        });
    }

    /// Return from `Indexing` to `Ready`.
    pub fn mark_ready(&self) {
        self.state_tx.send_modify(|s| {
            if s.status == ServiceStatus::Indexing {
                s.status = ServiceStatus::Ready;
            }
        });
    }

    /// Stop the service and clear its handle.
    ///
    /// Tries a graceful signal first, then a forceful kill; on Windows
    /// the process tree is taken down with `taskkill`. The handle's
    /// address and status are cleared regardless of how termination
    /// went.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(mut child) = inner.child.take() {
            if let Some(pid) = child.id() {
                terminate_gracefully(pid).await;
            }
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }

        clear_handle(&self.config.state_dir);
        self.state_tx.send_modify(|s| {
            *s = ServiceState::initial();
        });
    }
}

/// Service handle persisted across CLI invocations so `qry service
/// status` and `stop` can find a process this one did not spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedHandle {
    pub port: u16,
    pub pid: u32,
}

fn handle_path(state_dir: &Path) -> PathBuf {
    state_dir.join("service.json")
}

fn write_handle(state_dir: &Path, handle: &PersistedHandle) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let json = serde_json::to_string(handle)?;
    std::fs::write(handle_path(state_dir), json)?;
    Ok(())
}

fn clear_handle(state_dir: &Path) {
    let _ = std::fs::remove_file(handle_path(state_dir));
}

/// Read the persisted handle, if a previous invocation left one.
pub fn read_handle(state_dir: &Path) -> Option<PersistedHandle> {
    let raw = std::fs::read_to_string(handle_path(state_dir)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Terminate a service recorded by a previous invocation. Returns the
/// handle that was stopped, if one existed.
pub async fn stop_external(state_dir: &Path) -> Option<PersistedHandle> {
    let handle = read_handle(state_dir)?;
    terminate_gracefully(handle.pid).await;
    clear_handle(state_dir);
    Some(handle)
}

#[cfg(unix)]
async fn terminate_gracefully(pid: u32) {
    let _ = tokio::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .await;
}

#[cfg(windows)]
async fn terminate_gracefully(pid: u32) {
    let _ = tokio::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .status()
        .await;
}

fn venv_python(venv_dir: &std::path::Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts").join("python.exe")
    } else {
        venv_dir.join("bin").join("python")
    }
}

/// Ask the OS for a free loopback port.
fn pick_free_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").context("Failed to probe for a free port")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stub_config(script: &std::path::Path) -> ServiceConfig {
        ServiceConfig {
            python_bin: "/bin/sh".to_string(),
            script: script.to_path_buf(),
            state_dir: script.parent().unwrap().to_path_buf(),
            requirements: None,
            port: None,
            health_interval_secs: 0,
            health_attempts: 2,
            manage_env: false,
        }
    }

    #[test]
    fn test_pick_free_port() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_start_spawns_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let script = dir.path().join("service.sh");
        std::fs::write(
            &script,
            format!("echo started >> {}\nsleep 30\n", marker.display()),
        )
        .unwrap();

        let supervisor = Arc::new(ServiceSupervisor::new(stub_config(&script)));

        let a = Arc::clone(&supervisor);
        let b = Arc::clone(&supervisor);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.start().await }),
            tokio::spawn(async move { b.start().await }),
        );
        let sa = ra.unwrap().unwrap();
        let sb = rb.unwrap().unwrap();

        // Both callers converge on the same running service.
        assert_eq!(sa.status, ServiceStatus::Ready);
        assert_eq!(sb.status, ServiceStatus::Ready);
        assert_eq!(sa.port, sb.port);

        // Exactly one process was spawned.
        let spawned = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(spawned.lines().count(), 1);

        supervisor.stop().await;
        assert_eq!(supervisor.state().status, ServiceStatus::NotStarted);
        assert!(supervisor.state().port.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_alive_but_unhealthy_goes_degraded_ready() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("service.sh");
        std::fs::write(&script, "sleep 30\n").unwrap();

        let supervisor = ServiceSupervisor::new(stub_config(&script));
        let state = supervisor.start().await.unwrap();
        assert_eq!(state.status, ServiceStatus::Ready);
        assert!(state.degraded);

        supervisor.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exiting_process_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("service.sh");
        std::fs::write(&script, "exit 3\n").unwrap();

        // One-second polling interval so the child has exited by the
        // time the liveness check runs.
        let mut config = stub_config(&script);
        config.health_interval_secs = 1;
        let supervisor = ServiceSupervisor::new(config);
        let result = supervisor.start().await;
        assert!(result.is_err());
        assert_eq!(supervisor.state().status, ServiceStatus::Failed);

        // A later caller-initiated start retries from scratch (and
        // fails the same way here).
        assert!(supervisor.start().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_indexing_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("service.sh");
        std::fs::write(&script, "sleep 30\n").unwrap();

        let supervisor = ServiceSupervisor::new(stub_config(&script));
        supervisor.start().await.unwrap();

        supervisor.mark_indexing();
        assert_eq!(supervisor.state().status, ServiceStatus::Indexing);
        supervisor.mark_ready();
        assert_eq!(supervisor.state().status, ServiceStatus::Ready);

        // mark_indexing is a no-op when not ready.
        supervisor.stop().await;
        supervisor.mark_indexing();
        assert_eq!(supervisor.state().status, ServiceStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_missing_script_fails() {
        let config = stub_config(std::path::Path::new("/nonexistent/service.py"));
        let supervisor = ServiceSupervisor::new(config);
        assert!(supervisor.start().await.is_err());
        assert_eq!(supervisor.state().status, ServiceStatus::Failed);
    }
}
