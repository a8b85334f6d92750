//! Concrete cache tiers.

mod asset;
mod disk;
pub mod edge;
mod object;

pub use asset::AssetSnapshotDriver;
pub use disk::DiskSnapshotDriver;
pub use edge::{
    EdgeAcceleratorDriver, HttpPurgeTransport, PurgeTarget, PurgeTransport, ResponseContext,
    ViewContext,
};
pub use object::ObjectCacheDriver;
