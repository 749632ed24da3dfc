/// Admission control for the dispatcher.
///
/// A fixed number of permits exist. A permit is held for exactly as long as
/// one work item runs and goes back to the pool when the `Permit` is dropped,
/// whichever way the item finished (return, error, or panic unwinding).
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared counters, updated by every acquire/release.
#[derive(Debug, Default)]
struct Occupancy {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Pool of `size` admission permits.
#[derive(Debug, Clone)]
pub struct PermitPool {
    semaphore: Arc<Semaphore>,
    occupancy: Arc<Occupancy>,
    size: usize,
}

/// One acquired permit. Released on drop.
#[derive(Debug)]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
    occupancy: Arc<Occupancy>,
}

impl PermitPool {
    /// Sizes above `Semaphore::MAX_PERMITS` are clamped to it.
    pub fn new(size: usize) -> Self {
        let size = size.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            occupancy: Arc::new(Occupancy::default()),
            size,
        }
    }

    /// Wait until a permit is free and take it.
    ///
    /// Returns `None` only if the pool was closed, which `PermitPool` never
    /// does itself.
    pub async fn acquire(&self) -> Option<Permit> {
        let inner = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(self.admit(inner))
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let inner = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.admit(inner))
    }

    fn admit(&self, inner: OwnedSemaphorePermit) -> Permit {
        let now = self.occupancy.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.occupancy.peak.fetch_max(now, Ordering::AcqRel);
        Permit {
            _inner: inner,
            occupancy: Arc::clone(&self.occupancy),
        }
    }

    /// Total number of permits.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.occupancy.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of permits ever held at the same time.
    pub fn peak(&self) -> usize {
        self.occupancy.peak.load(Ordering::Acquire)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        // Runs before `_inner` is dropped, so in_flight never lags behind a
        // waiter that has already been admitted.
        self.occupancy.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
