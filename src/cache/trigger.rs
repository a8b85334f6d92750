//! Cache trigger service.
//!
//! Named entry points for the content layer. Each one turns into a
//! [`MutationSignal`] routed through the manager's signal bindings.

use std::sync::Arc;

use tracing::debug;

use super::events::MutationSignal;
use super::manager::{CacheManager, ClearReport};

/// Convenience surface over [`CacheManager::handle_mutation`].
///
/// # Usage
///
/// ```ignore
/// // After a post is saved:
/// trigger.content_saved().await;
/// ```
#[derive(Clone)]
pub struct CacheTrigger {
    manager: Arc<CacheManager>,
}

impl CacheTrigger {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }

    /// Route a signal. `None` until the cache has been initialized.
    pub async fn trigger(&self, signal: MutationSignal) -> Option<ClearReport> {
        let report = self.manager.handle_mutation(&signal).await;
        if report.is_none() {
            debug!(signal = ?signal, "cache trigger skipped: cache not initialized");
        }
        report
    }

    pub async fn content_saved(&self) -> Option<ClearReport> {
        self.trigger(MutationSignal::ContentSaved).await
    }

    pub async fn comment_posted(&self) -> Option<ClearReport> {
        self.trigger(MutationSignal::CommentPosted).await
    }

    pub async fn theme_switched(&self) -> Option<ClearReport> {
        self.trigger(MutationSignal::ThemeSwitched).await
    }

    pub async fn plugin_activated(&self, name: &str) -> Option<ClearReport> {
        self.trigger(MutationSignal::PluginActivated {
            name: name.to_string(),
        })
        .await
    }

    pub async fn plugin_deactivated(&self, name: &str) -> Option<ClearReport> {
        self.trigger(MutationSignal::PluginDeactivated {
            name: name.to_string(),
        })
        .await
    }

    /// Menus appear on every page, so this is bound to the full clear.
    pub async fn navigation_updated(&self) -> Option<ClearReport> {
        self.trigger(MutationSignal::NavigationUpdated).await
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }
}
