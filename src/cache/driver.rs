//! Driver capability contract shared by every cache tier.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use super::keys::CacheKey;
use super::snapshot::SnapshotError;

/// Identity of a registered tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    DiskSnapshot,
    ObjectCache,
    EdgeAccelerator,
    AssetSnapshot,
}

impl DriverKind {
    pub const ALL: [DriverKind; 4] = [
        DriverKind::DiskSnapshot,
        DriverKind::ObjectCache,
        DriverKind::EdgeAccelerator,
        DriverKind::AssetSnapshot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiskSnapshot => "disk_snapshot",
            Self::ObjectCache => "object_cache",
            Self::EdgeAccelerator => "edge_accelerator",
            Self::AssetSnapshot => "asset_snapshot",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown cache driver `{0}`")]
pub struct UnknownDriver(pub String);

impl FromStr for DriverKind {
    type Err = UnknownDriver;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownDriver(value.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver initialization failed: {0}")]
    Init(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Uniform operations every tier exposes to the manager.
///
/// Tiers without keyed access implement `get`/`set` as no-ops; `delete` and
/// `clear` must still produce their externally visible effect.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    async fn initialize(&self) -> Result<(), DriverError>;

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, DriverError>;

    async fn set(&self, key: &CacheKey, value: Bytes) -> Result<(), DriverError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), DriverError>;

    async fn clear(&self) -> Result<(), DriverError>;
}
