use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{delegate_store, Tables};
use crate::error::{VpnError, VpnResult};
use crate::files;
use crate::model::{Peer, PeerFilter, Protocol, ProtocolAccess, ProtocolConfig, VpnUser};

/// File-backed store
///
/// The whole state is one JSON document. Every mutation is applied to a
/// copy, the copy is written to disk, and only then does it replace the
/// in-memory state, so a failed write leaves both sides untouched.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonStore {
    /// Open the state file, starting empty when it does not exist yet
    pub async fn open<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match files::read_optional(&path).await? {
            Some(content) if !content.trim().is_empty() => serde_json::from_str(&content)
                .map_err(|e| VpnError::Store(format!("Corrupt state file {:?}: {}", path, e)))?,
            _ => {
                info!("No state at {:?}, starting empty", path);
                Tables::default()
            }
        };

        Ok(Self { path, tables: Mutex::new(tables) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.lock().await;
        f(&tables)
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> VpnResult<T>) -> VpnResult<T> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let result = f(&mut next)?;

        let content = serde_json::to_string_pretty(&next)
            .map_err(|e| VpnError::Store(format!("Failed to serialize state: {}", e)))?;
        files::write_secure_config(&self.path, &content, 0o600)
            .await
            .map_err(|e| VpnError::Store(format!("Failed to persist state: {}", e)))?;
        debug!("Persisted state to {:?}", self.path);

        *tables = next;
        Ok(result)
    }
}

delegate_store!(JsonStore);
