//! HTTP edge accelerator tier.
//!
//! The accelerator is controlled through response headers and out-of-band
//! `PURGE` requests. Responses carry a comma-joined tag list; purges name a
//! tag, an exact URL, or everything via the regex policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use bytes::Bytes;
use metrics::counter;
use reqwest::Method;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::config::EdgeConfig;
use crate::cache::driver::{CacheDriver, DriverError, DriverKind};
use crate::cache::keys::CacheKey;

pub const TAG_HEADER: HeaderName = HeaderName::from_static("x-cache-tags");
pub const CACHEABLE_HEADER: HeaderName = HeaderName::from_static("x-cacheable");
pub const PURGE_METHOD_HEADER: HeaderName = HeaderName::from_static("x-purge-method");

pub const GLOBAL_TAG: &str = "global";
pub const ARCHIVE_TAG: &str = "archive";

const METRIC_PURGE_DISPATCH: &str = "tierguard_purge_dispatch_total";

/// Slack on top of the transport timeout when waiting for purges to finish.
const SETTLE_GRACE: Duration = Duration::from_millis(250);

pub fn post_tag(post_id: u64) -> String {
    format!("post-{post_id}")
}

pub fn term_tag(term_id: u64) -> String {
    format!("term-{term_id}")
}

/// What the response being tagged shows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ViewContext {
    /// A single content item and the taxonomy terms attached to it.
    Single { post_id: u64, term_ids: Vec<u64> },
    /// A listing, optionally filtered to one term.
    Listing { term_id: Option<u64> },
    #[default]
    Other,
}

/// Per-response facts the accelerator headers depend on.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    pub authenticated: bool,
    pub feed: bool,
    pub trackback: bool,
    pub view: ViewContext,
}

impl ResponseContext {
    fn is_uncacheable(&self) -> bool {
        self.authenticated || self.feed || self.trackback
    }
}

/// Tag set for a view: always `global`, plus view-specific tags.
pub fn purge_tags(view: &ViewContext) -> Vec<String> {
    let mut tags = vec![GLOBAL_TAG.to_string()];
    match view {
        ViewContext::Single { post_id, term_ids } => {
            tags.push(post_tag(*post_id));
            tags.extend(term_ids.iter().copied().map(term_tag));
        }
        ViewContext::Listing { term_id } => {
            tags.push(ARCHIVE_TAG.to_string());
            if let Some(term_id) = term_id {
                tags.push(term_tag(*term_id));
            }
        }
        ViewContext::Other => {}
    }
    tags
}

/// One purge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    Tag(String),
    Url { host: String, path: String },
    All,
}

impl PurgeTarget {
    fn label(&self) -> &'static str {
        match self {
            Self::Tag(_) => "tag",
            Self::Url { .. } => "url",
            Self::All => "all",
        }
    }
}

/// Delivers purge requests to the accelerator.
#[async_trait]
pub trait PurgeTransport: Send + Sync {
    async fn send(&self, target: &PurgeTarget) -> Result<(), DriverError>;
}

/// `PURGE` over HTTP with a short timeout and relaxed certificate checks; the
/// accelerator sits on a private network.
pub struct HttpPurgeTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPurgeTransport {
    pub fn new(config: &EdgeConfig) -> Result<Self, DriverError> {
        let client = reqwest::Client::builder()
            .timeout(config.purge_timeout)
            .connect_timeout(config.purge_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| DriverError::init(format!("failed to build purge client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
        })
    }
}

#[async_trait]
impl PurgeTransport for HttpPurgeTransport {
    async fn send(&self, target: &PurgeTarget) -> Result<(), DriverError> {
        let method = Method::from_bytes(b"PURGE")
            .map_err(|err| DriverError::Network(format!("invalid purge method: {err}")))?;

        let request = match target {
            PurgeTarget::Tag(tag) => self
                .client
                .request(method, format!("{}/", self.base_url))
                .header(TAG_HEADER, tag.as_str())
                .header(PURGE_METHOD_HEADER, "tag"),
            PurgeTarget::Url { host, path } => self
                .client
                .request(method, format!("{}{}", self.base_url, path))
                .header(header::HOST, host.as_str())
                .header(PURGE_METHOD_HEADER, "exact"),
            PurgeTarget::All => self
                .client
                .request(method, format!("{}/.*", self.base_url))
                .header(PURGE_METHOD_HEADER, "regex"),
        };

        let response = request
            .send()
            .await
            .map_err(|err| DriverError::Network(err.to_string()))?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|err| DriverError::Network(err.to_string()))
    }
}

/// Purges spawned and not yet finished.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Holds one slot in [`InFlight`] until the purge task ends, however it ends.
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Edge accelerator driver.
pub struct EdgeAcceleratorDriver {
    config: EdgeConfig,
    transport: Arc<dyn PurgeTransport>,
    in_flight: Arc<InFlight>,
}

impl EdgeAcceleratorDriver {
    pub fn new(config: EdgeConfig, transport: Arc<dyn PurgeTransport>) -> Self {
        Self {
            config,
            transport,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Number of purges dispatched and still running.
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait for dispatched purges to finish, bounded by the purge timeout.
    /// Returns false when some were still running at the deadline.
    ///
    /// Short-lived processes call this before exiting; dropping the runtime
    /// cancels whatever is still in flight.
    pub async fn settle(&self) -> bool {
        let drained = async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.pending() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(self.config.purge_timeout + SETTLE_GRACE, drained)
            .await
            .is_ok()
    }

    /// Add accelerator headers to an outgoing response.
    pub fn apply_headers(&self, context: &ResponseContext, headers: &mut HeaderMap) {
        if context.is_uncacheable() {
            headers.insert(CACHEABLE_HEADER, HeaderValue::from_static("NO"));
            return;
        }

        let tags = purge_tags(&context.view).join(",");
        match HeaderValue::from_str(&tags) {
            Ok(value) => {
                headers.insert(TAG_HEADER, value);
            }
            Err(err) => warn!(tags = %tags, error = %err, "purge tags are not a valid header"),
        }

        let cache_control = format!("public, max-age={}", self.config.default_ttl.as_secs());
        if let Ok(value) = HeaderValue::from_str(&cache_control) {
            headers.insert(header::CACHE_CONTROL, value);
        }
    }

    /// Purge one post, the archive listings, and each of the post's terms.
    /// Returns the number of dispatches issued.
    pub fn purge_post(&self, post_id: u64, term_ids: &[u64]) -> usize {
        let mut targets = vec![
            PurgeTarget::Tag(post_tag(post_id)),
            PurgeTarget::Tag(ARCHIVE_TAG.to_string()),
        ];
        targets.extend(
            term_ids
                .iter()
                .copied()
                .map(|term_id| PurgeTarget::Tag(term_tag(term_id))),
        );

        info!(post_id, terms = term_ids.len(), "purging post from edge");
        targets
            .into_iter()
            .filter(|target| self.dispatch(target.clone()))
            .count()
    }

    /// Ban every tagged object.
    pub fn purge_all(&self) -> usize {
        info!("purging all objects from edge");
        usize::from(self.dispatch(PurgeTarget::All))
    }

    /// Fire-and-forget: the request runs on its own task and the caller never
    /// waits for the accelerator. Returns false when no runtime is available.
    fn dispatch(&self, target: PurgeTarget) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(target_kind = target.label(), "no async runtime; purge dropped");
                counter!(METRIC_PURGE_DISPATCH, "result" => "dropped").increment(1);
                return false;
            }
        };

        let transport = Arc::clone(&self.transport);
        let guard = InFlightGuard::enter(&self.in_flight);
        handle.spawn(async move {
            let _guard = guard;
            match transport.send(&target).await {
                Ok(()) => {
                    debug!(target_kind = target.label(), purge = ?target, "purge delivered");
                    counter!(METRIC_PURGE_DISPATCH, "result" => "delivered").increment(1);
                }
                Err(err) => {
                    debug!(
                        target_kind = target.label(),
                        purge = ?target,
                        error = %err,
                        "purge failed; relying on edge ttl"
                    );
                    counter!(METRIC_PURGE_DISPATCH, "result" => "failed").increment(1);
                }
            }
        });
        true
    }
}

#[async_trait]
impl CacheDriver for EdgeAcceleratorDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::EdgeAccelerator
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        if self.config.host.trim().is_empty() {
            return Err(DriverError::init("edge accelerator host is empty"));
        }
        if self.config.port == 0 {
            return Err(DriverError::init("edge accelerator port is zero"));
        }
        Ok(())
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<Bytes>, DriverError> {
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _value: Bytes) -> Result<(), DriverError> {
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), DriverError> {
        self.dispatch(PurgeTarget::Url {
            host: key.host().to_string(),
            path: key.path().to_string(),
        });
        Ok(())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.purge_all();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::cache::device::DeviceClass;

    /// Sends every purge into a channel instead of the network.
    pub(crate) struct ChannelTransport {
        sender: mpsc::UnboundedSender<PurgeTarget>,
    }

    impl ChannelTransport {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PurgeTarget>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Arc::new(Self { sender }), receiver)
        }
    }

    #[async_trait]
    impl PurgeTransport for ChannelTransport {
        async fn send(&self, target: &PurgeTarget) -> Result<(), DriverError> {
            self.sender
                .send(target.clone())
                .map_err(|err| DriverError::Network(err.to_string()))
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl PurgeTransport for FailingTransport {
        async fn send(&self, _target: &PurgeTarget) -> Result<(), DriverError> {
            Err(DriverError::Network("connection refused".to_string()))
        }
    }

    /// Delivers after a fixed delay.
    struct SlowTransport {
        delay: Duration,
        sender: mpsc::UnboundedSender<PurgeTarget>,
    }

    #[async_trait]
    impl PurgeTransport for SlowTransport {
        async fn send(&self, target: &PurgeTarget) -> Result<(), DriverError> {
            tokio::time::sleep(self.delay).await;
            self.sender
                .send(target.clone())
                .map_err(|err| DriverError::Network(err.to_string()))
        }
    }

    async fn collect(
        receiver: &mut mpsc::UnboundedReceiver<PurgeTarget>,
        expected: usize,
    ) -> Vec<PurgeTarget> {
        let mut seen = Vec::new();
        for _ in 0..expected {
            let target = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
                .await
                .expect("purge should arrive")
                .expect("channel open");
            seen.push(target);
        }
        seen
    }

    fn driver(transport: Arc<dyn PurgeTransport>) -> EdgeAcceleratorDriver {
        EdgeAcceleratorDriver::new(
            EdgeConfig {
                default_ttl: Duration::from_secs(600),
                ..Default::default()
            },
            transport,
        )
    }

    #[test]
    fn tags_for_single_view() {
        let tags = purge_tags(&ViewContext::Single {
            post_id: 42,
            term_ids: vec![3, 9],
        });
        assert_eq!(tags, vec!["global", "post-42", "term-3", "term-9"]);
    }

    #[test]
    fn tags_for_listing_view() {
        assert_eq!(
            purge_tags(&ViewContext::Listing { term_id: Some(5) }),
            vec!["global", "archive", "term-5"]
        );
        assert_eq!(
            purge_tags(&ViewContext::Listing { term_id: None }),
            vec!["global", "archive"]
        );
        assert_eq!(purge_tags(&ViewContext::Other), vec!["global"]);
    }

    #[tokio::test]
    async fn cacheable_response_gets_tags_and_cache_control() {
        let (transport, _receiver) = ChannelTransport::new();
        let driver = driver(transport);
        let mut headers = HeaderMap::new();

        driver.apply_headers(
            &ResponseContext {
                view: ViewContext::Single {
                    post_id: 1,
                    term_ids: vec![2],
                },
                ..Default::default()
            },
            &mut headers,
        );

        assert_eq!(headers[TAG_HEADER], "global,post-1,term-2");
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=600");
        assert!(headers.get(CACHEABLE_HEADER).is_none());
    }

    #[tokio::test]
    async fn authenticated_feed_and_trackback_are_not_cached() {
        let (transport, _receiver) = ChannelTransport::new();
        let driver = driver(transport);

        for context in [
            ResponseContext {
                authenticated: true,
                ..Default::default()
            },
            ResponseContext {
                feed: true,
                ..Default::default()
            },
            ResponseContext {
                trackback: true,
                ..Default::default()
            },
        ] {
            let mut headers = HeaderMap::new();
            driver.apply_headers(&context, &mut headers);
            assert_eq!(headers[CACHEABLE_HEADER], "NO");
            assert!(headers.get(TAG_HEADER).is_none());
            assert!(headers.get(header::CACHE_CONTROL).is_none());
        }
    }

    #[tokio::test]
    async fn purge_post_with_two_terms_dispatches_four_requests() {
        let (transport, mut receiver) = ChannelTransport::new();
        let driver = driver(transport);

        let issued = driver.purge_post(7, &[11, 12]);
        assert_eq!(issued, 4);

        let mut seen = collect(&mut receiver, 4).await;
        seen.sort_by_key(|target| format!("{target:?}"));
        let mut expected = vec![
            PurgeTarget::Tag("post-7".to_string()),
            PurgeTarget::Tag("archive".to_string()),
            PurgeTarget::Tag("term-11".to_string()),
            PurgeTarget::Tag("term-12".to_string()),
        ];
        expected.sort_by_key(|target| format!("{target:?}"));
        assert_eq!(seen, expected);

        tokio::task::yield_now().await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn purge_all_and_clear_use_regex_policy() {
        let (transport, mut receiver) = ChannelTransport::new();
        let driver = driver(transport);

        assert_eq!(driver.purge_all(), 1);
        driver.clear().await.unwrap();

        assert_eq!(
            collect(&mut receiver, 2).await,
            vec![PurgeTarget::All, PurgeTarget::All]
        );
    }

    #[tokio::test]
    async fn delete_purges_exact_url() {
        let (transport, mut receiver) = ChannelTransport::new();
        let driver = driver(transport);
        let key = CacheKey::new("example.com", "/blog/post-1", DeviceClass::Mobile).unwrap();

        driver.delete(&key).await.unwrap();

        assert_eq!(
            collect(&mut receiver, 1).await,
            vec![PurgeTarget::Url {
                host: "example.com".to_string(),
                path: "/blog/post-1".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn keyed_reads_are_no_ops() {
        let (transport, _receiver) = ChannelTransport::new();
        let driver = driver(transport);
        let key = CacheKey::new("example.com", "/", DeviceClass::Desktop).unwrap();

        driver.set(&key, Bytes::from_static(b"x")).await.unwrap();
        assert!(driver.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_transport_does_not_surface() {
        let driver = driver(Arc::new(FailingTransport));
        assert_eq!(driver.purge_post(1, &[]), 2);
        driver.clear().await.unwrap();
    }

    #[tokio::test]
    async fn settle_waits_for_dispatched_purges() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let driver = driver(Arc::new(SlowTransport {
            delay: Duration::from_millis(50),
            sender,
        }));

        assert_eq!(driver.purge_post(3, &[8]), 3);
        assert_eq!(driver.pending(), 3);
        assert!(driver.settle().await);

        assert_eq!(driver.pending(), 0);
        let mut delivered = 0;
        while receiver.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn settle_returns_immediately_when_idle() {
        let (transport, _receiver) = ChannelTransport::new();
        let driver = driver(transport);
        assert!(driver.settle().await);
    }

    #[tokio::test]
    async fn settle_gives_up_after_the_purge_timeout() {
        let (sender, _receiver) = mpsc::unbounded_channel();
        let driver = EdgeAcceleratorDriver::new(
            EdgeConfig {
                purge_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            Arc::new(SlowTransport {
                delay: Duration::from_secs(5),
                sender,
            }),
        );

        assert_eq!(driver.purge_all(), 1);
        assert!(!driver.settle().await);
        assert_eq!(driver.pending(), 1);
    }

    #[test]
    fn purge_without_runtime_is_dropped() {
        let (transport, _receiver) = ChannelTransport::new();
        let driver = driver(transport);
        assert_eq!(driver.purge_all(), 0);
    }

    #[tokio::test]
    async fn initialize_rejects_empty_host() {
        let (transport, _receiver) = ChannelTransport::new();
        let driver = EdgeAcceleratorDriver::new(
            EdgeConfig {
                host: " ".to_string(),
                ..Default::default()
            },
            transport,
        );
        assert!(matches!(driver.initialize().await, Err(DriverError::Init(_))));
    }
}
