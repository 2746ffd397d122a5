use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{ProxyScanError, Result};

type Teardown = Box<dyn FnOnce() + Send>;

/// Handle to one running tunnel engine
///
/// Owns the child process, the files it was started from and an optional
/// teardown callback. [`TunnelProcess::shutdown`] is the orderly path;
/// dropping the handle still kills the child, removes the artifacts and
/// runs the callback.
pub struct TunnelProcess {
    child: Option<Child>,
    artifacts: Vec<PathBuf>,
    on_teardown: Option<Teardown>,
}

impl TunnelProcess {
    pub fn new(child: Child, artifacts: Vec<PathBuf>) -> Self {
        Self {
            child: Some(child),
            artifacts,
            on_teardown: None,
        }
    }

    /// A handle with no subprocess behind it
    pub fn detached(artifacts: Vec<PathBuf>) -> Self {
        Self {
            child: None,
            artifacts,
            on_teardown: None,
        }
    }

    /// Run `f` exactly once when this handle is torn down
    pub fn with_teardown(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_teardown = Some(Box::new(f));
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Whether the child has already exited
    pub fn has_exited(&mut self) -> bool {
        match &mut self.child {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the child, wait for it, remove artifacts and run the teardown callback
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Engine process already gone");
            }
        }

        for path in std::mem::take(&mut self.artifacts) {
            let removed = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = removed {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove engine artifact");
                }
            }
        }

        if let Some(teardown) = self.on_teardown.take() {
            teardown();
        }
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
        for path in &self.artifacts {
            let _ = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
        }
        if let Some(teardown) = self.on_teardown.take() {
            teardown();
        }
    }
}

impl std::fmt::Debug for TunnelProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelProcess")
            .field("pid", &self.pid())
            .field("artifacts", &self.artifacts)
            .finish()
    }
}

/// Everything needed to start one engine process
pub(crate) struct LaunchSpec<'a> {
    pub bin: &'a Path,
    pub args: Vec<OsString>,
    pub config_path: PathBuf,
    pub config_body: Vec<u8>,
    /// Receives the engine's stderr
    pub log_path: PathBuf,
    /// Directories removed on teardown after the files
    pub extra_artifacts: Vec<PathBuf>,
}

/// Write the config and spawn the engine with stderr sent to the log file
pub(crate) async fn spawn(launch: LaunchSpec<'_>) -> Result<TunnelProcess> {
    if let Some(parent) = launch.config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&launch.config_path, &launch.config_body).await?;
    let log = tokio::fs::File::create(&launch.log_path).await?.into_std().await;

    let mut artifacts = vec![launch.config_path, launch.log_path];
    artifacts.extend(launch.extra_artifacts);

    let spawned = Command::new(launch.bin)
        .args(&launch.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .kill_on_drop(true)
        .spawn();

    match spawned {
        Ok(child) => {
            debug!(bin = %launch.bin.display(), pid = child.id(), "Spawned engine process");
            Ok(TunnelProcess::new(child, artifacts))
        }
        Err(e) => {
            // Dropping the detached handle removes what was written
            drop(TunnelProcess::detached(artifacts));
            Err(ProxyScanError::ProxyUnavailable(format!(
                "failed to spawn {}: {}",
                launch.bin.display(),
                e
            )))
        }
    }
}
