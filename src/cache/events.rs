//! Cache signals.
//!
//! Two directions: [`MutationSignal`]s come in from the content layer and are
//! mapped onto a [`ClearScope`]; [`CacheSignal`]s go out to observers once a
//! clear finishes. Observers subscribe to a [`SignalBus`] and run
//! synchronously, in subscription order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::lock::{mutex_lock, rw_read, rw_write};
use super::manager::ClearReport;

const SOURCE: &str = "cache::events";
const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Monotonic sequence number for emitted signals within this process.
pub type Epoch = u64;

/// Invalidation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearScope {
    /// Rendering caches only; compiled code stays warm.
    Content,
    /// Everything, including the compiled-code cache.
    All,
}

impl fmt::Display for ClearScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => f.write_str("content"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Content or structure changed somewhere upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum MutationSignal {
    /// Every clear is tier-wide, so the signal names no post.
    ContentSaved,
    CommentPosted,
    ThemeSwitched,
    PluginActivated {
        name: String,
    },
    PluginDeactivated {
        name: String,
    },
    NavigationUpdated,
}

/// Discriminant of [`MutationSignal`], used as the binding table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    ContentSaved,
    CommentPosted,
    ThemeSwitched,
    PluginActivated,
    PluginDeactivated,
    NavigationUpdated,
}

impl MutationKind {
    pub const ALL: [MutationKind; 6] = [
        MutationKind::ContentSaved,
        MutationKind::CommentPosted,
        MutationKind::ThemeSwitched,
        MutationKind::PluginActivated,
        MutationKind::PluginDeactivated,
        MutationKind::NavigationUpdated,
    ];

    /// Severity a signal of this kind is bound to.
    ///
    /// Content edits are frequent and keep compiled code warm; structural
    /// changes are rare and clear everything.
    pub fn default_scope(self) -> ClearScope {
        match self {
            Self::ContentSaved | Self::CommentPosted => ClearScope::Content,
            Self::ThemeSwitched
            | Self::PluginActivated
            | Self::PluginDeactivated
            | Self::NavigationUpdated => ClearScope::All,
        }
    }
}

impl MutationSignal {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::ContentSaved => MutationKind::ContentSaved,
            Self::CommentPosted => MutationKind::CommentPosted,
            Self::ThemeSwitched => MutationKind::ThemeSwitched,
            Self::PluginActivated { .. } => MutationKind::PluginActivated,
            Self::PluginDeactivated { .. } => MutationKind::PluginDeactivated,
            Self::NavigationUpdated => MutationKind::NavigationUpdated,
        }
    }
}

/// Emitted once a clear has finished.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CacheSignal {
    ContentCacheCleared(ClearReport),
    AllCachesCleared(ClearReport),
}

impl CacheSignal {
    pub fn report(&self) -> &ClearReport {
        match self {
            Self::ContentCacheCleared(report) | Self::AllCachesCleared(report) => report,
        }
    }

    pub fn scope(&self) -> ClearScope {
        match self {
            Self::ContentCacheCleared(_) => ClearScope::Content,
            Self::AllCachesCleared(_) => ClearScope::All,
        }
    }
}

/// A signal together with its delivery metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SignalEnvelope {
    pub id: Uuid,
    pub epoch: Epoch,
    pub signal: CacheSignal,
    #[serde(with = "time::serde::rfc3339")]
    pub emitted_at: OffsetDateTime,
}

type Observer = Arc<dyn Fn(&SignalEnvelope) + Send + Sync>;

/// Ordered, synchronous observer registry with a short delivery history.
pub struct SignalBus {
    observers: RwLock<Vec<Observer>>,
    history: Mutex<VecDeque<SignalEnvelope>>,
    history_limit: usize,
    epoch_counter: AtomicU64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Register an observer; it runs after every observer registered before it.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&SignalEnvelope) + Send + Sync + 'static,
    {
        rw_write(&self.observers, SOURCE, "subscribe").push(Arc::new(observer));
    }

    pub fn observer_count(&self) -> usize {
        rw_read(&self.observers, SOURCE, "observer_count").len()
    }

    /// Deliver `signal` to every observer and record it in the history.
    pub fn emit(&self, signal: CacheSignal) -> SignalEnvelope {
        let envelope = SignalEnvelope {
            id: Uuid::new_v4(),
            epoch: self.epoch_counter.fetch_add(1, Ordering::SeqCst),
            signal,
            emitted_at: OffsetDateTime::now_utc(),
        };

        info!(
            signal_id = %envelope.id,
            signal_epoch = envelope.epoch,
            scope = %envelope.signal.scope(),
            success = envelope.signal.report().success,
            errors = envelope.signal.report().errors.len(),
            "Cache signal emitted"
        );

        // Snapshot the list so observers may subscribe further observers.
        let observers = rw_read(&self.observers, SOURCE, "emit").clone();
        for observer in observers {
            observer(&envelope);
        }

        if self.history_limit > 0 {
            let mut history = mutex_lock(&self.history, SOURCE, "emit.history");
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(envelope.clone());
        }

        envelope
    }

    /// Most recent envelopes, oldest first.
    pub fn recent(&self) -> Vec<SignalEnvelope> {
        mutex_lock(&self.history, SOURCE, "recent")
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
