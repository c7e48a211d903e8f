use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{PluginError, PluginGateway, timeout_for};
use crate::config::PluginConfig;

/// Runs the plugin executable once per request.
///
/// Invocations are independent processes. When `max_concurrent_invocations` is non-zero, a
/// semaphore caps how many run at the same time; callers wait for a permit.
#[derive(Clone)]
pub struct SubprocessPlugin {
    config: PluginConfig,
    permits: Option<Arc<Semaphore>>,
}

impl SubprocessPlugin {
    pub fn new(config: PluginConfig) -> Self {
        let permits = match config.max_concurrent_invocations {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self { config, permits }
    }
}

#[async_trait]
impl PluginGateway for SubprocessPlugin {
    async fn invoke(&self, request: &serde_json::Value) -> Result<serde_json::Value, PluginError> {
        let _permit = match &self.permits {
            Some(permits) => Some(permits.clone().acquire_owned().await.map_err(|_| PluginError::Unavailable)?),
            None => None,
        };

        let timeout = timeout_for(&self.config, request);
        let payload = request.to_string();
        let path = self.config.path.display().to_string();

        let mut child = Command::new(&self.config.path)
            .arg(&payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PluginError::Spawn { path: path.clone(), source })?;

        let mut stdout = child.stdout.take().ok_or(PluginError::Unavailable)?;
        let mut stderr = child.stderr.take().ok_or(PluginError::Unavailable)?;

        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (read_out, read_err) = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
            read_out?;
            read_err?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };
        let outcome = tokio::time::timeout(timeout, run).await;

        let (status, out, err) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!("Plugin {} exceeded its {}s deadline, killing it", path, timeout.as_secs());
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out plugin {}: {}", path, e);
                }
                return Err(PluginError::Timeout { timeout });
            }
        };

        if !status.success() {
            debug!("Plugin {} exited with {}", path, status);
        }

        let reply = parse_output(&out).map_err(|message| PluginError::InvalidOutput {
            message: format!("{message} (exit status: {status}, stderr: {})", snippet(&err)),
        })?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            warn!("Plugin {} reported an error: {}", path, message);
            return Err(PluginError::Reported(message));
        }

        Ok(reply)
    }
}

/// The plugin may print diagnostics before its reply; the reply is either the whole output or
/// its last non-empty line.
fn parse_output(out: &[u8]) -> Result<serde_json::Value, String> {
    let text = String::from_utf8_lossy(out);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty output".to_string());
    }

    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(whole_err) => trimmed
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| format!("output is not JSON: {whole_err}")),
    }
}

fn snippet(bytes: &[u8]) -> String {
    const MAX: usize = 256;
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
