//! Unit launch interface and the OS process implementation

use crate::runtime::unit::UnitSpec;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// A launched unit, owned by exactly one supervisor
#[async_trait]
pub trait RunningUnit: Send {
    /// Identifier of the launched resource (the pid for processes)
    fn id(&self) -> String;

    /// Resolves when the unit exits on its own, with its exit code if known.
    ///
    /// Must be cancel safe: it is raced against probe ticks and stop requests.
    async fn exited(&mut self) -> Option<i32>;

    /// Release the resource, forcing it after `grace`
    async fn stop(&mut self, grace: Duration) -> Result<(), LaunchError>;
}

/// External runtime that actually runs units
#[async_trait]
pub trait UnitLauncher: Send + Sync {
    async fn start(&self, unit: &UnitSpec) -> Result<Box<dyn RunningUnit>, LaunchError>;
}

/// Launches units as child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UnitLauncher for ProcessLauncher {
    async fn start(&self, unit: &UnitSpec) -> Result<Box<dyn RunningUnit>, LaunchError> {
        let launch = &unit.launch;
        log::info!(
            "[{}] Starting: {} {}",
            unit.name,
            launch.command,
            launch.args.join(" ")
        );

        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &launch.working_dir {
            if !dir.is_dir() {
                return Err(LaunchError::Rejected {
                    unit: unit.name.clone(),
                    reason: format!("working directory '{}' does not exist", dir.display()),
                });
            }
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            unit: unit.name.clone(),
            command: launch.command.clone(),
            source: e,
        })?;

        let pid = child.id().unwrap_or(0);
        log::info!("[{}] Process started with PID: {}", unit.name, pid);

        if let Some(stdout) = child.stdout.take() {
            let name = unit.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::info!("[{}] {}", name, line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let name = unit.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("[{}] {}", name, line);
                }
            });
        }

        Ok(Box::new(ProcessHandle {
            name: unit.name.clone(),
            pid,
            child,
            exit: None,
        }))
    }
}

/// Handle to a child process started by [`ProcessLauncher`]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    child: Child,
    /// Set once the process has been reaped
    exit: Option<Option<i32>>,
}

impl ProcessHandle {
    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // pid 0 would signal our whole process group
        if self.pid == 0 {
            let _ = self.child.start_kill();
            return;
        }
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            log::debug!("[{}] SIGTERM failed: {}", self.name, e);
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl RunningUnit for ProcessHandle {
    fn id(&self) -> String {
        self.pid.to_string()
    }

    async fn exited(&mut self) -> Option<i32> {
        if let Some(code) = self.exit {
            return code;
        }
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                log::error!("[{}] Error waiting for process: {}", self.name, e);
                None
            }
        };
        self.exit = Some(code);
        code
    }

    async fn stop(&mut self, grace: Duration) -> Result<(), LaunchError> {
        if self.exit.is_some() {
            return Ok(());
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit = Some(status.code());
            return Ok(());
        }

        log::info!("[{}] Stopping process...", self.name);
        self.terminate();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("[{}] Process exited with code: {:?}", self.name, status.code());
                self.exit = Some(status.code());
                Ok(())
            }
            Ok(Err(e)) => Err(LaunchError::Stop {
                unit: self.name.clone(),
                source: e,
            }),
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within {}ms, forcing kill",
                    self.name,
                    grace.as_millis()
                );
                self.child.kill().await.map_err(|e| LaunchError::Stop {
                    unit: self.name.clone(),
                    source: e,
                })?;
                self.exit = Some(None);
                Ok(())
            }
        }
    }
}

/// Errors raised by a launcher
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn '{command}' for unit '{unit}': {source}")]
    Spawn {
        unit: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stop unit '{unit}': {source}")]
    Stop {
        unit: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Runtime rejected unit '{unit}': {reason}")]
    Rejected { unit: String, reason: String },
}
