use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

/// A counted semaphore bounding either bytes or messages admitted to a processing stage.
///
/// Acquisition waits until capacity is available and never fails; release is non-blocking.
///  Requests larger than the whole capacity are clamped so a single oversized message can
///  still pass (alone) instead of deadlocking.
pub struct Throttle {
    name: &'static str,
    max: u64,
    sem: Semaphore,
}

impl Throttle {
    pub fn new(name: &'static str, max: u64) -> Arc<Throttle> {
        Arc::new(Throttle {
            name,
            max,
            sem: Semaphore::new(max.min(u32::MAX as u64) as usize),
        })
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn available(&self) -> u64 {
        self.sem.available_permits() as u64
    }

    fn clamp(&self, amount: u64) -> u32 {
        amount.min(self.max).min(u32::MAX as u64) as u32
    }

    /// Waits until `amount` units are available and takes them. The returned token gives the
    ///  units back when dropped.
    pub async fn acquire(self: &Arc<Self>, amount: u64) -> ThrottleToken {
        let clamped = self.clamp(amount);
        trace!("throttle {}: acquiring {} ({} available)", self.name, clamped, self.available());
        self.sem
            .acquire_many(clamped)
            .await
            .expect("throttle semaphore is never closed")
            .forget();
        ThrottleToken {
            throttle: self.clone(),
            amount: clamped,
        }
    }
}

/// RAII handle for acquired throttle units; releases on drop.
pub struct ThrottleToken {
    throttle: Arc<Throttle>,
    amount: u32,
}

impl Drop for ThrottleToken {
    fn drop(&mut self) {
        trace!("throttle {}: releasing {}", self.throttle.name, self.amount);
        self.throttle.sem.add_permits(self.amount as usize);
    }
}
