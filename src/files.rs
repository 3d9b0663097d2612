//! Host file helpers shared by the store and the protocol renderers

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{VpnError, VpnResult};

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> VpnResult<()> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| VpnError::Io(std::io::Error::new(e.kind(), format!("Failed to create directory {:?}: {}", path, e))))?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write a file with the given mode, replacing any previous content
/// atomically. The content lands in a sibling temp file first, gets its
/// permissions, and is then renamed over the target so readers never see a
/// partial file or a window with loose permissions.
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> VpnResult<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent).await?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VpnError::InvalidParameter(format!("Not a file path: {:?}", path)))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    tokio::fs::write(&tmp, content).await.map_err(|e| wrap_io(e, "write", &tmp))?;
    tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(permissions))
        .await
        .map_err(|e| wrap_io(e, "set permissions on", &tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| wrap_io(e, "replace", path))?;

    debug!("Wrote {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// Read a file, returning `None` when it does not exist
pub async fn read_optional(path: &Path) -> VpnResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(wrap_io(e, "read", path)),
    }
}

fn wrap_io(e: std::io::Error, action: &str, path: &Path) -> VpnError {
    VpnError::Io(std::io::Error::new(e.kind(), format!("Failed to {} {:?}: {}", action, path, e)))
}
