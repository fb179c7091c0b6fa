//! Interfaces to collaborators outside the protocol core
//!
//! Remote bootstrap, bulk artifact transfer and result packaging are
//! delegated to shell commands in production. Each is a trait so the test
//! harness can swap in in-memory versions.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::process::Command;

use syncshot_core::{AgentId, SyncError, SyncResult};

/// Boxed future returned by the async collaborator traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Replace `{key}` placeholders in a command template.
///
/// Unknown placeholders are left untouched.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{}}}", key), value);
    }
    rendered
}

async fn run_shell(command: &str) -> Result<(), String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{}: {}", output.status, stderr.trim()))
    }
}

// ============================================================================
// LAUNCH
// ============================================================================

/// Starts the agent process on a remote host
pub trait Launcher: Send + Sync {
    /// Fire-and-forget. Returning does not mean the agent is up; that is
    /// only known once it connects.
    fn launch(&self, address: &str, agent: AgentId) -> SyncResult<()>;
}

/// Runs a templated shell command per host, e.g.
/// `ssh admin{id}@{address} syncshot-agent --coordinator 192.168.1.253:5000`.
pub struct CommandLauncher {
    template: String,
}

impl CommandLauncher {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn command_for(&self, address: &str, agent: AgentId) -> String {
        let id = agent.to_string();
        render_template(&self.template, &[("address", address), ("id", &id)])
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, address: &str, agent: AgentId) -> SyncResult<()> {
        let command = self.command_for(address, agent);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .spawn()
            .map_err(|e| SyncError::Launch {
                address: address.to_string(),
                detail: e.to_string(),
            })?;

        let address = address.to_string();
        tokio::spawn(async move {
            let mut child = child;
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::debug!(%address, "launch command finished");
                }
                Ok(status) => tracing::warn!(%address, %status, "launch command failed"),
                Err(e) => tracing::warn!(%address, "launch command: {}", e),
            }
        });
        Ok(())
    }
}

/// Launcher for fleets whose agents are started out of band
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLauncher;

impl Launcher for NoopLauncher {
    fn launch(&self, _address: &str, _agent: AgentId) -> SyncResult<()> {
        Ok(())
    }
}

// ============================================================================
// PULL
// ============================================================================

/// Fetches one agent's result blob after the session
pub trait ArtifactPuller: Send + Sync {
    fn pull(&self, agent: AgentId) -> BoxFuture<'_, SyncResult<Vec<u8>>>;
}

/// Runs a templated copy command (`{id}`, `{dest}`) and reads the fetched
/// file, e.g. `scp admin{id}@192.168.1.{id}:capture_results{id}.csv {dest}`.
pub struct CommandPuller {
    template: String,
    dest_dir: PathBuf,
}

impl CommandPuller {
    pub fn new(template: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            dest_dir: dest_dir.into(),
        }
    }

    pub fn destination(&self, agent: AgentId) -> PathBuf {
        self.dest_dir
            .join(format!("capture_data_cam_{:02}.csv", agent.get()))
    }
}

impl ArtifactPuller for CommandPuller {
    fn pull(&self, agent: AgentId) -> BoxFuture<'_, SyncResult<Vec<u8>>> {
        Box::pin(async move {
            let pull_error = |detail: String| SyncError::Pull { agent, detail };

            let dest = self.destination(agent);
            let dest_str = dest.to_string_lossy();
            let id = agent.to_string();
            let command =
                render_template(&self.template, &[("id", &id), ("dest", dest_str.as_ref())]);

            tokio::fs::create_dir_all(&self.dest_dir)
                .await
                .map_err(|e| pull_error(e.to_string()))?;
            run_shell(&command).await.map_err(pull_error)?;
            tokio::fs::read(&dest)
                .await
                .map_err(|e| pull_error(format!("{}: {}", dest.display(), e)))
        })
    }
}

// ============================================================================
// PACKAGING
// ============================================================================

/// Agent-side staging of the result blob for the pull
pub trait ResultPackager: Send {
    fn package(&mut self, agent: AgentId, csv: &str) -> SyncResult<()>;

    /// Release local results once the coordinator has them. Called on every
    /// exit path, so it must tolerate nothing having been packaged.
    fn release(&mut self, agent: AgentId);
}

/// Writes `capture_results{id}.csv` into a directory
pub struct DirectoryPackager {
    dir: PathBuf,
    written: Option<PathBuf>,
}

impl DirectoryPackager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: None,
        }
    }

    pub fn result_path(dir: &Path, agent: AgentId) -> PathBuf {
        dir.join(format!("capture_results{}.csv", agent.get()))
    }
}

impl ResultPackager for DirectoryPackager {
    fn package(&mut self, agent: AgentId, csv: &str) -> SyncResult<()> {
        let path = Self::result_path(&self.dir, agent);
        std::fs::create_dir_all(&self.dir).map_err(|e| SyncError::Packaging(e.to_string()))?;
        std::fs::write(&path, csv)
            .map_err(|e| SyncError::Packaging(format!("{}: {}", path.display(), e)))?;

        tracing::info!(%agent, path = %path.display(), "results packaged");
        self.written = Some(path);
        Ok(())
    }

    fn release(&mut self, agent: AgentId) {
        if let Some(path) = self.written.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(%agent, path = %path.display(), "release: {}", e);
            }
        }
    }
}
