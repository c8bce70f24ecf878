//! Traffic splitter contract and the single-flight write wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TrafficError;

/// Applies a canary weight to the routing layer for one workload.
///
/// `set_weight` must be idempotent: writing the weight that is already
/// applied has no side effect.
#[async_trait]
pub trait TrafficSplitter: Send + Sync {
    async fn set_weight(&self, canary_percent: u8) -> Result<(), TrafficError>;

    /// Weight currently applied by the routing layer.
    fn current_weight(&self) -> u8;
}

/// Hands out the splitter for a workload.
pub trait SplitterProvider: Send + Sync {
    fn splitter_for(&self, workload: &str) -> Result<Arc<dyn TrafficSplitter>, TrafficError>;
}

/// Serializes weight writes for one rollout.
///
/// `set_weight` waits behind an in-flight write; `try_set_weight` rejects
/// with [`TrafficError::Busy`] instead.
pub struct SingleFlight {
    inner: Arc<dyn TrafficSplitter>,
    lock: Mutex<()>,
}

impl SingleFlight {
    pub fn new(inner: Arc<dyn TrafficSplitter>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }

    /// Write without queueing.
    pub async fn try_set_weight(&self, canary_percent: u8) -> Result<(), TrafficError> {
        let _guard = self.lock.try_lock().map_err(|_| TrafficError::Busy)?;
        self.inner.set_weight(canary_percent).await
    }
}

#[async_trait]
impl TrafficSplitter for SingleFlight {
    async fn set_weight(&self, canary_percent: u8) -> Result<(), TrafficError> {
        let _guard = self.lock.lock().await;
        debug!(weight = canary_percent, "applying canary weight");
        self.inner.set_weight(canary_percent).await
    }

    fn current_weight(&self) -> u8 {
        self.inner.current_weight()
    }
}
