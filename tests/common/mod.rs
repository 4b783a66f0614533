//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use elf_access_limiter::store::{
    InMemoryStore, RateLimitStore, StoreRequest, StoreResult,
};
use elf_access_limiter::Result;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

static INIT_TRACING: Once = Once::new();

/// Initialize test logging once per binary; RUST_LOG controls verbosity
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Manually advanced clock driving an [`InMemoryStore`]
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<RwLock<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn set(&self, seconds: f64) {
        *self.now.write() = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.write() += seconds;
    }

    pub fn store(&self) -> InMemoryStore {
        let now = self.now.clone();
        InMemoryStore::with_clock(Arc::new(move || *now.read()))
    }
}

/// Store wrapper counting evaluations, for asserting bypass semantics
/// (a bypassed request must produce zero store writes).
pub struct CountingStore {
    inner: InMemoryStore,
    evaluations: AtomicU64,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn wrapping(inner: InMemoryStore) -> Self {
        Self {
            inner,
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateLimitStore for CountingStore {
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        self.inner.evaluate(request).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
