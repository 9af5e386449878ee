//! SHA-256 verification of plugin binaries

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{PluginError, PluginResult};

/// Decode a hex checksum into the raw digest bytes
pub fn decode(checksum: &str) -> PluginResult<Vec<u8>> {
    let bytes = hex::decode(checksum.trim()).map_err(|e| PluginError::InvalidChecksum {
        checksum: checksum.to_string(),
        reason: e.to_string(),
    })?;

    if bytes.len() != Sha256::output_size() {
        return Err(PluginError::InvalidChecksum {
            checksum: checksum.to_string(),
            reason: format!(
                "expected {} bytes, got {}",
                Sha256::output_size(),
                bytes.len()
            ),
        });
    }
    Ok(bytes)
}

/// SHA-256 of `bytes`
pub fn digest(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// Whether `bytes` hash to `expected`
pub fn verify(bytes: &[u8], expected: &[u8]) -> bool {
    digest(bytes).as_slice() == expected
}

/// Hash the binary at `path` and compare it with the hex `checksum`
pub async fn verify_file(path: &Path, checksum: &str) -> PluginResult<()> {
    let expected = decode(checksum)?;
    let bytes = tokio::fs::read(path).await?;

    if verify(&bytes, &expected) {
        tracing::debug!(path = %path.display(), "Plugin checksum verified");
        return Ok(());
    }

    Err(PluginError::ChecksumMismatch {
        path: path.to_path_buf(),
        expected: hex::encode(expected),
        actual: hex::encode(digest(&bytes)),
    })
}
