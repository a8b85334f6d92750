//! Cache key definitions.
//!
//! A [`CacheKey`] identifies one rendered variant of one URL. The same key
//! locates the disk snapshot, keys the object cache, and names the URL the
//! edge accelerator purges.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::device::DeviceClass;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("request host is empty")]
    EmptyHost,
    #[error("request host `{0}` contains forbidden characters")]
    InvalidHost(String),
    #[error("request path `{0}` escapes the snapshot root")]
    PathTraversal(String),
}

/// Identity of a cached page variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    host: String,
    path: String,
    device: DeviceClass,
}

impl CacheKey {
    /// Build a key from raw request parts, normalizing host and path.
    pub fn new(host: &str, path: &str, device: DeviceClass) -> Result<Self, KeyError> {
        Ok(Self {
            host: normalize_host(host)?,
            path: normalize_path(path)?,
            device,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn device(&self) -> DeviceClass {
        self.device
    }

    /// Same page, other variant.
    pub fn with_device(&self, device: DeviceClass) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }

    /// SHA-256 hex digest of `host|path|device`, stable across processes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.host.as_bytes());
        hasher.update(b"|");
        hasher.update(self.path.as_bytes());
        hasher.update(b"|");
        hasher.update(self.device.as_str().as_bytes());
        hex::encode(hasher.finalize().as_slice())
    }

    /// Path segments below the host directory, root yields none.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|segment| !segment.is_empty())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} [{}]", self.host, self.path, self.device)
    }
}

/// Lowercase the host and drop any port suffix.
pub fn normalize_host(host: &str) -> Result<String, KeyError> {
    let trimmed = host.trim();
    let without_port = match trimmed.rsplit_once(':') {
        Some((name, port)) if !name.contains(']') || name.ends_with(']') => {
            if port.chars().all(|c| c.is_ascii_digit()) {
                name
            } else {
                trimmed
            }
        }
        _ => trimmed,
    };

    if without_port.is_empty() {
        return Err(KeyError::EmptyHost);
    }

    if without_port
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
        || without_port == "."
        || without_port == ".."
    {
        return Err(KeyError::InvalidHost(host.to_string()));
    }

    Ok(without_port.to_ascii_lowercase())
}

/// Normalize a request path: leading slash, no empty segments, no trailing
/// slash except for the root, and no `.`/`..` segments.
pub fn normalize_path(path: &str) -> Result<String, KeyError> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(KeyError::PathTraversal(path.to_string())),
            other if other.contains('\\') || other.contains('\0') => {
                return Err(KeyError::PathTraversal(path.to_string()));
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Ok("/".to_string());
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    Ok(normalized)
}
