//! Starting storage node processes

use crate::common::{CacheStrategy, Error, Result};
use std::future::Future;
use tokio::process::Command;

/// Everything a launcher needs to start one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub cache_strategy: CacheStrategy,
    pub cache_size: usize,
    pub registry_addr: String,
}

impl LaunchSpec {
    /// Arguments understood by `ringkv-node serve`.
    pub fn node_args(&self) -> Vec<String> {
        vec![
            "--name".to_string(),
            self.node_name.clone(),
            "--bind".to_string(),
            format!("{}:{}", self.host, self.port),
            "--cache-strategy".to_string(),
            self.cache_strategy.to_string(),
            "--cache-size".to_string(),
            self.cache_size.to_string(),
        ]
    }
}

/// Starts a node and returns once the start command completed.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> impl Future<Output = Result<()>> + Send;
}

/// Runs a program (typically a shell script wrapping ssh or a supervisor)
/// with the node arguments appended.
///
/// The host goes in `RINGKV_LAUNCH_HOST` and the registry address in
/// `RINGKV_REGISTRY` so the script can decide where and how to start the node.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    program: String,
    args: Vec<String>,
}

impl ScriptLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Launcher for ScriptLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        tracing::info!("Launching {} on {}:{}", spec.node_name, spec.host, spec.port);

        let output = Command::new(&self.program)
            .args(&self.args)
            .args(spec.node_args())
            .env("RINGKV_LAUNCH_HOST", &spec.host)
            .env("RINGKV_REGISTRY", &spec.registry_addr)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::LaunchFailed {
                node: spec.node_name.clone(),
                reason: format!("cannot run {}: {}", self.program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::LaunchFailed {
                node: spec.node_name.clone(),
                reason: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}
