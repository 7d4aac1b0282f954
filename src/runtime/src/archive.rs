//! In-memory build context archives.
//!
//! The engine's build endpoint only accepts a tar stream as its context, even
//! when the context is a single generated Dockerfile. This module serializes
//! named byte blobs into such a stream without touching the filesystem.

use kiln_core::error::{KilnError, Result};
use sha2::{Digest, Sha256};

/// A single named file destined for the build context.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    name: String,
    content: Vec<u8>,
}

impl ArchiveEntry {
    /// Create an entry. The name must be non-empty; content may be empty.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(KilnError::EncodingError(
                "archive entry name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            content: content.into(),
        })
    }

    /// Path of the entry inside the archive.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Size in bytes, as declared in the entry header.
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Ordered set of entries that make up one build context.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    entries: Vec<ArchiveEntry>,
}

impl BuildContext {
    /// A context holding exactly one file.
    pub fn single(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Result<Self> {
        Ok(Self {
            entries: vec![ArchiveEntry::new(name, content)?],
        })
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Serialize all entries, in order, into a tar stream.
    pub fn into_archive(self) -> Result<ContextArchive> {
        let mut builder = tar::Builder::new(Vec::new());

        for entry in &self.entries {
            let header = entry_header(entry)?;
            builder.append(&header, entry.content()).map_err(|e| {
                KilnError::EncodingError(format!(
                    "failed to write entry {}: {}",
                    entry.name(),
                    e
                ))
            })?;
        }

        let bytes = builder
            .into_inner()
            .map_err(|e| KilnError::EncodingError(format!("failed to finalize archive: {}", e)))?;
        let digest = sha256_bytes(&bytes);

        tracing::debug!(
            entries = self.entries.len(),
            bytes = bytes.len(),
            digest = %digest,
            "Built context archive"
        );

        Ok(ContextArchive { bytes, digest })
    }
}

/// A serialized build context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextArchive {
    /// Raw tar bytes
    pub bytes: Vec<u8>,
    /// SHA256 digest of `bytes` (hex string, without "sha256:" prefix)
    pub digest: String,
}

impl ContextArchive {
    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Build a single-entry tar archive holding `content` under `name`.
pub fn build_archive(name: &str, content: &[u8]) -> Result<Vec<u8>> {
    Ok(BuildContext::single(name, content)?.into_archive()?.bytes)
}

/// Fixed ustar header so identical inputs produce identical archives.
fn entry_header(entry: &ArchiveEntry) -> Result<tar::Header> {
    let mut header = tar::Header::new_ustar();
    header.set_path(entry.name()).map_err(|e| {
        KilnError::EncodingError(format!("invalid entry name {:?}: {}", entry.name(), e))
    })?;
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(entry.size());
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    Ok(header)
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
