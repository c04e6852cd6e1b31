//! GPU resource manager: accelerator slots behind a bounded FIFO semaphore
//!
//! ## Protocol
//!
//! - `probe()` answers once per manager and caches; `invalidate_probe()` forces
//!   a re-probe on next use
//! - `acquire(timeout)` fails fast with `Unavailable` when the probe says so,
//!   otherwise queues in arrival order until a slot frees or `timeout` passes
//! - At most `slots` handles are outstanding at any time
//! - `release(handle)` is idempotent and dropping a handle releases it

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use shared_utils::{AcceleratorCapability, GpuAccel};
use tracing::{debug, info, trace, warn};

use crate::errors::ResourceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum AcceleratorStatus {
    Available,
    Unavailable(String),
}

impl AcceleratorStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AcceleratorStatus::Available)
    }
}

impl fmt::Display for AcceleratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorStatus::Available => write!(f, "available"),
            AcceleratorStatus::Unavailable(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}

/// Source of accelerator facts
pub trait AcceleratorProbe: Send + Sync {
    fn probe(&self) -> AcceleratorCapability;
}

/// Runs hardware encoder detection through ffmpeg on every probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl AcceleratorProbe for SystemProbe {
    fn probe(&self) -> AcceleratorCapability {
        GpuAccel::detect_fresh().capability()
    }
}

/// Fixed answer, for forced-CPU operation and tests.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub AcceleratorCapability);

impl StaticProbe {
    pub fn present() -> Self {
        Self(AcceleratorCapability {
            gpu_type: shared_utils::GpuType::Nvidia,
            device_present: true,
            memory_free_mb: None,
            hwaccel: Some("cuda"),
        })
    }

    pub fn absent() -> Self {
        Self(AcceleratorCapability::absent())
    }
}

impl AcceleratorProbe for StaticProbe {
    fn probe(&self) -> AcceleratorCapability {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Concurrent accelerator sessions
    pub slots: usize,
    pub acquire_timeout_ms: u64,
    /// Below this much free device memory the accelerator counts as unavailable
    pub min_memory_mb: Option<u64>,
    pub force_cpu: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            slots: 1,
            acquire_timeout_ms: 5_000,
            min_memory_mb: None,
            force_cpu: false,
        }
    }
}

impl DeviceConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

struct SlotQueue {
    /// Free slot numbers, popped from the back
    free: Vec<usize>,
    /// Tickets in arrival order; only the front may take a slot
    waiting: VecDeque<u64>,
    next_ticket: u64,
}

struct DeviceInner {
    slots: usize,
    min_memory_mb: Option<u64>,
    force_cpu: bool,
    probe: Box<dyn AcceleratorProbe>,
    status: RwLock<Option<AcceleratorStatus>>,
    queue: Mutex<SlotQueue>,
    freed: Condvar,
    next_handle: AtomicU64,
}

impl DeviceInner {
    fn lock_queue(&self) -> MutexGuard<'_, SlotQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outstanding(&self) -> usize {
        self.slots.saturating_sub(self.lock_queue().free.len())
    }

    fn release(&self, handle: &DeviceHandle) {
        if handle.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut queue = self.lock_queue();
        queue.free.push(handle.slot);
        let outstanding = self.slots.saturating_sub(queue.free.len());
        drop(queue);
        self.freed.notify_all();
        trace!(handle = handle.id, slot = handle.slot, outstanding, "Device slot released");
    }
}

/// Checked-out accelerator slot. Released on drop.
pub struct DeviceHandle {
    id: u64,
    slot: usize,
    released: AtomicBool,
    inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.inner.release(self);
    }
}

/// Owner of the accelerator slots. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("slots", &self.inner.slots)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl DeviceManager {
    pub fn new(config: &DeviceConfig, probe: impl AcceleratorProbe + 'static) -> Self {
        let slots = config.slots;
        Self {
            inner: Arc::new(DeviceInner {
                slots,
                min_memory_mb: config.min_memory_mb,
                force_cpu: config.force_cpu,
                probe: Box::new(probe),
                status: RwLock::new(None),
                queue: Mutex::new(SlotQueue {
                    free: (0..slots).rev().collect(),
                    waiting: VecDeque::new(),
                    next_ticket: 0,
                }),
                freed: Condvar::new(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    pub fn slots(&self) -> usize {
        self.inner.slots
    }

    /// Cached accelerator status.
    pub fn probe(&self) -> AcceleratorStatus {
        if let Some(status) = self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return status.clone();
        }

        let mut cached = self.inner.status.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = cached.as_ref() {
            return status.clone();
        }
        let status = self.evaluate();
        info!(status = %status, slots = self.inner.slots, "Accelerator probed");
        *cached = Some(status.clone());
        status
    }

    fn evaluate(&self) -> AcceleratorStatus {
        if self.inner.force_cpu {
            return AcceleratorStatus::Unavailable("accelerator disabled by configuration".into());
        }
        if self.inner.slots == 0 {
            return AcceleratorStatus::Unavailable("no device slots configured".into());
        }

        let capability = self.inner.probe.probe();
        if !capability.device_present {
            return AcceleratorStatus::Unavailable("no accelerator device detected".into());
        }
        if let (Some(min), Some(free)) = (self.inner.min_memory_mb, capability.memory_free_mb) {
            if free < min {
                return AcceleratorStatus::Unavailable(format!(
                    "{} MB free device memory, {} MB required",
                    free, min
                ));
            }
        }
        AcceleratorStatus::Available
    }

    pub fn invalidate_probe(&self) {
        *self.inner.status.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("Accelerator probe cache cleared");
    }

    /// Take a slot, waiting in FIFO order for at most `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<DeviceHandle, ResourceError> {
        if let AcceleratorStatus::Unavailable(reason) = self.probe() {
            return Err(ResourceError::Unavailable(reason));
        }

        let start = Instant::now();
        let deadline = start + timeout;
        let mut queue = self.inner.lock_queue();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.waiting.push_back(ticket);

        loop {
            if queue.waiting.front() == Some(&ticket) {
                if let Some(slot) = queue.free.pop() {
                    queue.waiting.pop_front();
                    let wake_next = !queue.free.is_empty() && !queue.waiting.is_empty();
                    let outstanding = self.inner.slots - queue.free.len();
                    drop(queue);
                    if wake_next {
                        self.inner.freed.notify_all();
                    }

                    let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        handle = id,
                        slot,
                        outstanding,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "Device slot acquired"
                    );
                    return Ok(DeviceHandle {
                        id,
                        slot,
                        released: AtomicBool::new(false),
                        inner: Arc::clone(&self.inner),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                queue.waiting.retain(|t| *t != ticket);
                drop(queue);
                // the queue head may have changed
                self.inner.freed.notify_all();
                let waited_ms = start.elapsed().as_millis() as u64;
                debug!(waited_ms, "Device slot acquire timed out");
                return Err(ResourceError::Timeout { waited_ms });
            }

            let (guard, _) = self
                .inner
                .freed
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }

    /// Return a slot to the manager that issued it. Releasing twice is a no-op.
    pub fn release(&self, handle: &DeviceHandle) {
        if !Arc::ptr_eq(&handle.inner, &self.inner) {
            warn!(handle = handle.id, slot = handle.slot, "Handle issued by another device manager");
        }
        handle.inner.release(handle);
    }

    /// Handles currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }
}
