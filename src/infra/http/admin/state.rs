use std::sync::Arc;

use crate::cache::{CacheManager, CacheTrigger, RewriteRuleGenerator, drivers::EdgeAcceleratorDriver};
use crate::infra::mirror::PostgresMirrorStore;

#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<CacheManager>,
    pub trigger: CacheTrigger,
    pub edge: Option<Arc<EdgeAcceleratorDriver>>,
    pub rules: Arc<RewriteRuleGenerator>,
    pub mirror: Option<PostgresMirrorStore>,
}
