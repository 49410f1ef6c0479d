use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::remote::Remote;

/// On-disk schema for the single persisted field. `serde_json` ignores
/// unrecognized keys by default, so a state file carrying a legacy
/// `GracePeriod` entry from an older version still decodes cleanly.
#[derive(Debug, Serialize, Deserialize)]
struct ServerState {
    #[serde(rename = "RemoteAddress")]
    remote_address: String,
}

/// Persists the logical upstream address to a small JSON file so it
/// survives process restarts.
pub struct StateStore {
    path: Option<PathBuf>,
}

impl StateStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        StateStore { path }
    }

    /// Load persisted state on startup. If no path is configured, a no-op.
    /// If the file is missing or empty, the current in-memory value (from
    /// the CLI) is written out instead. Decode failures are fatal.
    pub async fn load(&self, remote: &Remote) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let contents = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.save(remote).await;
                return Ok(());
            }
            Err(source) => {
                return Err(ConfigError::StateRead {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        if contents.trim().is_empty() {
            self.save(remote).await;
            return Ok(());
        }

        let state: ServerState =
            serde_json::from_str(&contents).map_err(|source| ConfigError::StateDecode {
                path: path.display().to_string(),
                source,
            })?;

        remote.set_addr(state.remote_address.clone()).await;
        info!(addr = %state.remote_address, "loaded remote address from state file");
        Ok(())
    }

    /// Persist the current remote address. No-op if no path is
    /// configured. Failures here are logged and swallowed rather than
    /// propagated, since the in-memory state remains authoritative.
    pub async fn save(&self, remote: &Remote) {
        let Some(path) = &self.path else {
            return;
        };

        let state = ServerState {
            remote_address: remote.get_addr().await,
        };

        if let Err(e) = Self::write_atomically(path, &state).await {
            warn!(path = %path.display(), "cannot write state file: {e}");
        }
    }

    async fn write_atomically(path: &Path, state: &ServerState) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let json = serde_json::to_string(state)?;
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn round_trips_remote_address() {
        let dir = tempfile_dir();
        let path = dir.join("state.json");

        let remote = Remote::new("127.0.0.1:9000".to_string(), Duration::from_secs(10)).unwrap();
        let store = StateStore::new(Some(path.clone()));
        store.save(&remote).await;

        let reloaded = Remote::new("127.0.0.1:9999".to_string(), Duration::from_secs(10)).unwrap();
        let reload_store = StateStore::new(Some(path));
        reload_store.load(&reloaded).await.unwrap();
        assert_eq!(reloaded.get_addr().await, "127.0.0.1:9000");

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn missing_file_is_created_from_defaults() {
        let dir = tempfile_dir();
        let path = dir.join("state.json");

        let remote = Remote::new("127.0.0.1:9000".to_string(), Duration::from_secs(10)).unwrap();
        let store = StateStore::new(Some(path.clone()));
        store.load(&remote).await.unwrap();

        assert!(path.exists());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn unknown_keys_are_ignored() {
        let dir = tempfile_dir();
        let path = dir.join("state.json");
        tokio::fs::write(
            &path,
            r#"{"RemoteAddress":"127.0.0.1:9001","GracePeriod":5}"#,
        )
        .await
        .unwrap();

        let remote = Remote::new("127.0.0.1:9000".to_string(), Duration::from_secs(10)).unwrap();
        let store = StateStore::new(Some(path));
        store.load(&remote).await.unwrap();
        assert_eq!(remote.get_addr().await, "127.0.0.1:9001");

        std::fs::remove_dir_all(dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "tcpproxy-state-test-{}-{unique}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
