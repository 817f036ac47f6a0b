//! Operation interceptors and the per-client rate limiter.
//!
//! Interceptors run between authorization and the local apply, in
//! registration order. Each may pass the op through (possibly transformed),
//! drop it silently by returning `None`, or reject it with an error — the
//! only sanctioned silent drop in the write path.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use squall_core::protocol::ClientOp;
use squall_core::ClockSource;

use crate::auth::Principal;
use crate::config::RateLimitConfig;
use crate::error::GridError;

/// Per-operation context handed to interceptors.
#[derive(Debug, Clone)]
pub struct OpContext<'a> {
    pub client_id: &'a str,
    pub principal: &'a Principal,
}

/// A stage in the operation transformation chain.
pub trait OpInterceptor: Send + Sync {
    /// Inspects an op before it is applied.
    ///
    /// Returning `Ok(Some(op))` forwards the (possibly transformed) op,
    /// `Ok(None)` drops it without an error, and `Err` rejects it.
    ///
    /// # Errors
    ///
    /// Implementations reject ops by returning any [`GridError`].
    fn before_op(&self, ctx: &OpContext<'_>, op: ClientOp) -> Result<Option<ClientOp>, GridError>;
}

/// An ordered chain of interceptors.
#[derive(Default)]
pub struct InterceptorChain {
    stages: Vec<Arc<dyn OpInterceptor>>,
}

impl InterceptorChain {
    /// An empty chain that passes every op through.
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage; chain order is registration order.
    pub fn register(&mut self, interceptor: Arc<dyn OpInterceptor>) {
        self.stages.push(interceptor);
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the op through every stage.
    ///
    /// # Errors
    ///
    /// Propagates the first stage rejection unchanged.
    pub fn run(&self, ctx: &OpContext<'_>, op: ClientOp) -> Result<Option<ClientOp>, GridError> {
        let mut current = op;
        for stage in &self.stages {
            match stage.before_op(ctx, current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

/// Sliding-window operation budget per client.
///
/// Each client id tracks the timestamps of its recent ops; an op is admitted
/// while fewer than `max_ops` fall inside the trailing window. State for a
/// client is dropped when its connection closes via [`RateLimiter::forget`].
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn ClockSource>,
    windows: DashMap<String, Mutex<VecDeque<u64>>>,
}

impl RateLimiter {
    /// Creates a limiter with the given budget.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self { config, clock, windows: DashMap::new() }
    }

    /// Admits or rejects one op for `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::RateLimit`] when the trailing window already
    /// holds `max_ops` operations.
    pub fn check(&self, client_id: &str) -> Result<(), GridError> {
        let now = self.clock.wall_millis();
        let horizon = now.saturating_sub(self.config.window_ms);

        let entry = self
            .windows
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut window = entry.lock();

        while window.front().is_some_and(|&t| t <= horizon) {
            window.pop_front();
        }
        if window.len() >= self.config.max_ops as usize {
            metrics::counter!("squall_rate_limited_total").increment(1);
            return Err(GridError::RateLimit {
                window_ms: self.config.window_ms,
                max_ops: self.config.max_ops,
            });
        }
        window.push_back(now);
        Ok(())
    }

    /// Drops accounting for a disconnected client.
    pub fn forget(&self, client_id: &str) {
        self.windows.remove(client_id);
    }
}
