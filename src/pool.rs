use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Launches one browser process. Injected so the pool can be
/// exercised in tests without Chrome installed.
pub type LaunchFn<B> = Box<dyn Fn() -> anyhow::Result<B> + Send + Sync>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No browsers available - all busy")]
    Exhausted,

    #[error("Failed to launch replacement browser: {0}")]
    Launch(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_requests_per_browser: u64,
    pub lease_retry_interval: Duration,
    pub lease_max_retries: u32,
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct PoolStatus {
    pub browsers: usize,
    pub active: usize,
}

struct Slot<B> {
    browser: Arc<B>,
    busy: bool,
    requests: u64,
    created: Instant,
    id: Uuid,
}

impl<B> Slot<B> {
    fn new(browser: B) -> Self {
        Slot {
            browser: Arc::new(browser),
            busy: false,
            requests: 0,
            created: Instant::now(),
            id: Uuid::new_v4(),
        }
    }
}

/// Fixed-size pool of browser handles. Slots are claimed under one
/// mutex so a handle can never be leased to two callers at once.
pub struct BrowserPool<B> {
    slots: Mutex<Vec<Slot<B>>>,
    launch: LaunchFn<B>,
    cfg: PoolConfig,
    recycles: AtomicU64,
}

impl<B: Send + Sync + 'static> BrowserPool<B> {
    /// Launch `size` browsers up front. Individual launch failures are
    /// logged and tolerated; a pool with zero working browsers is fatal.
    pub fn init(size: usize, cfg: PoolConfig, launch: LaunchFn<B>) -> anyhow::Result<Arc<Self>> {
        info!("🚀 Initializing browser pool...");
        let mut slots = Vec::with_capacity(size);
        for i in 0..size {
            match launch() {
                Ok(browser) => {
                    info!("✅ Browser {} ready", i + 1);
                    slots.push(Slot::new(browser));
                }
                Err(e) => error!("❌ Failed to init browser {}: {}", i + 1, e),
            }
        }
        if slots.is_empty() {
            anyhow::bail!("no browsers could be launched");
        }
        Ok(Arc::new(BrowserPool {
            slots: Mutex::new(slots),
            launch,
            cfg,
            recycles: AtomicU64::new(0),
        }))
    }

    /// Claim the first free slot, blocking in a bounded poll loop when
    /// every slot is busy. A slot that has served its usage ceiling is
    /// recycled before being handed out.
    ///
    /// Blocking by design: callers run on the blocking thread pool.
    pub fn lease(self: &Arc<Self>) -> Result<Lease<B>, PoolError> {
        let mut tries = 0;
        let index = loop {
            if let Some(i) = self.try_claim() {
                break i;
            }
            if tries >= self.cfg.lease_max_retries {
                return Err(PoolError::Exhausted);
            }
            tries += 1;
            std::thread::sleep(self.cfg.lease_retry_interval);
        };

        if self.slot_requests(index) >= self.cfg.max_requests_per_browser {
            if let Err(e) = self.recycle(index) {
                warn!("⚠️ Recycle failed, releasing slot: {}", e);
                self.release(index);
                return Err(e);
            }
        }

        let mut slots = self.lock_slots();
        let slot = &mut slots[index];
        slot.requests += 1;
        Ok(Lease {
            browser: slot.browser.clone(),
            slot_id: slot.id,
            index,
            pool: self.clone(),
        })
    }

    /// Clear a slot's busy flag. Safe to call on an already-free slot.
    pub fn release(&self, index: usize) {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(index) {
            slot.busy = false;
        }
    }

    /// Replace a slot's browser with a freshly launched one. The old
    /// process is closed once the last outstanding handle drops; the
    /// slot keeps its position and its usage counter resets.
    pub fn recycle(&self, index: usize) -> Result<(), PoolError> {
        let fresh = (self.launch)().map_err(|e| PoolError::Launch(e.to_string()))?;
        let old = {
            let mut slots = self.lock_slots();
            let slot = &mut slots[index];
            let old = std::mem::replace(&mut slot.browser, Arc::new(fresh));
            tracing::debug!(
                "♻️ Recycled slot {} after {} requests ({}s alive)",
                slot.id,
                slot.requests,
                slot.created.elapsed().as_secs()
            );
            slot.requests = 0;
            slot.created = Instant::now();
            slot.id = Uuid::new_v4();
            old
        };
        drop(old);
        self.recycles.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn occupancy(&self) -> PoolStatus {
        let slots = self.lock_slots();
        PoolStatus {
            browsers: slots.len(),
            active: slots.iter().filter(|s| s.busy).count(),
        }
    }

    pub fn recycle_count(&self) -> u64 {
        self.recycles.load(Ordering::Relaxed)
    }

    /// Drop every slot, closing all browser processes.
    pub fn shutdown(&self) {
        info!("📛 Closing all pooled browsers...");
        self.lock_slots().clear();
    }

    fn try_claim(&self) -> Option<usize> {
        let mut slots = self.lock_slots();
        let index = slots.iter().position(|s| !s.busy)?;
        slots[index].busy = true;
        Some(index)
    }

    fn slot_requests(&self, index: usize) -> u64 {
        self.lock_slots()[index].requests
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot<B>>> {
        self.slots.lock().expect("pool mutex poisoned")
    }

    #[cfg(test)]
    fn slot_age(&self, index: usize) -> Duration {
        self.lock_slots()[index].created.elapsed()
    }
}

/// RAII claim on one pool slot. Dropping the lease releases the slot
/// unconditionally, whatever the scrape outcome was.
pub struct Lease<B: Send + Sync + 'static> {
    browser: Arc<B>,
    slot_id: Uuid,
    index: usize,
    pool: Arc<BrowserPool<B>>,
}

impl<B: Send + Sync + 'static> Lease<B> {
    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn slot_id(&self) -> Uuid {
        self.slot_id
    }
}

impl<B: Send + Sync + 'static> std::fmt::Debug for Lease<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("slot_id", &self.slot_id)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl<B: Send + Sync + 'static> Drop for Lease<B> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
