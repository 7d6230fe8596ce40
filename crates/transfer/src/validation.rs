use std::path::{Component, Path};

use crate::TransferError;

/// Longest object name accepted from a client.
const MAX_NAME_LEN: usize = 1024;

/// Validates a client-supplied object name before it reaches a sink.
///
/// Names are relative paths that must stay below the sink's per-transfer
/// directory. Rejects:
/// - Empty names and names longer than 1024 bytes
/// - Control characters (including NUL)
/// - Absolute paths, Windows prefixes (`C:`, `\\server`)
/// - Parent directory traversal (`..`)
/// - Names with no final file component (`dir/`, `.`)
pub fn validate_object_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TransferError::InvalidName(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TransferError::InvalidName(format!(
            "control character in name: {name:?}"
        )));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidName(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut has_file = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidName(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidName(format!(
                    "absolute path not allowed: {name}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(_) => has_file = true,
        }
    }

    if !has_file || name.ends_with('/') || name.ends_with('\\') {
        return Err(TransferError::InvalidName(format!(
            "name has no file component: {name}"
        )));
    }

    Ok(())
}
