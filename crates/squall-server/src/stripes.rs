//! Striped executor: per-key serial ordering without global locks.
//!
//! Every write is routed to a stripe chosen by hashing `(map, key)`, and each
//! stripe is one worker task draining a bounded queue. Two writes to the same
//! key therefore apply in submission order, while writes to different keys
//! run concurrently. The bounded queue is also the backpressure valve: past
//! the high-water mark, enqueueing blocks up to the configured deadline and
//! then fails the operation instead of buffering without bound.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use squall_core::hash::fnv1a;
use tokio::sync::mpsc;

use crate::config::{BackpressureConfig, WorkerPoolConfig};
use crate::error::GridError;

type Job = BoxFuture<'static, ()>;

/// Fixed pool of serial worker stripes.
pub struct StripedExecutor {
    senders: Vec<mpsc::Sender<Job>>,
    backoff: Duration,
    /// Saturation events between warn-level log lines.
    sync_frequency: u32,
    saturations: std::sync::atomic::AtomicU32,
}

impl StripedExecutor {
    /// Spawns the worker stripes.
    #[must_use]
    pub fn new(pool: &WorkerPoolConfig, backpressure: &BackpressureConfig) -> Arc<Self> {
        let stripes = pool.max.max(1);
        let mut senders = Vec::with_capacity(stripes);
        for stripe in 0..stripes {
            let (tx, mut rx) = mpsc::channel::<Job>(backpressure.max_pending.max(1));
            senders.push(tx);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                tracing::debug!(stripe, "stripe worker stopped");
            });
        }
        Arc::new(Self {
            senders,
            backoff: Duration::from_millis(backpressure.backoff_ms),
            sync_frequency: backpressure.sync_frequency.max(1),
            saturations: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// The stripe index `(map, key)` routes to.
    #[must_use]
    pub fn stripe_for(&self, map_name: &str, key: &str) -> usize {
        let hash = fnv1a(map_name) ^ fnv1a(key).rotate_left(16);
        (hash as usize) % self.senders.len()
    }

    /// Submits a job for `(map, key)`, preserving per-key order.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::Rejected`] when the stripe stays at its
    /// high-water mark for the whole backpressure deadline.
    pub async fn submit(
        &self,
        map_name: &str,
        key: &str,
        job: Job,
    ) -> Result<(), GridError> {
        let stripe = self.stripe_for(map_name, key);
        let sender = &self.senders[stripe];
        match tokio::time::timeout(self.backoff, sender.send(job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GridError::Fatal("stripe worker stopped".to_string())),
            Err(_) => {
                metrics::counter!("squall_backpressure_rejections_total").increment(1);
                let nth = self
                    .saturations
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if nth % self.sync_frequency == 0 {
                    tracing::warn!(stripe, "write path saturated; rejecting after backoff");
                }
                Err(GridError::Rejected("write path saturated".to_string()))
            }
        }
    }
}
