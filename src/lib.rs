//! Tierguard: cache coordination and invalidation for a content-rendering
//! service.
//!
//! The engine lives in [`cache`]. [`infra::http`] exposes it as a caching
//! reverse proxy in front of the renderer plus a private operator surface.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
