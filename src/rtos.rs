//! Operating system services
//!
//! The crate never creates threads, timers or semaphores itself. The host firmware
//! supplies them through the small traits below; [SpinSemaphore] and [EventFlags]
//! are lock-free defaults that work on any target with atomics.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Flag returned by [ThreadFlags::wait] when the wait itself failed
pub const FLAGS_ERROR: u32 = 0x8000_0000;

/// Binary semaphore with non-blocking acquisition
pub trait Semaphore {
    /// Takes the semaphore if it is free. Never blocks.
    fn try_acquire(&self) -> bool;

    /// Gives back a semaphore taken with [try_acquire](Semaphore::try_acquire)
    fn release(&self);
}

/// Millisecond delay of the calling thread
pub trait Delay {
    fn delay_ms(&self, ms: u32);
}

/// Event flags owned by a worker thread
pub trait ThreadFlags {
    /// ORs `flags` into the pending set. Must be callable from interrupt context.
    fn set(&self, flags: u32);

    /// Blocks until at least one flag is pending, then returns and clears all of them
    fn wait(&self) -> u32;
}

/// [Semaphore] backed by a single [AtomicBool]
#[derive(Default)]
pub struct SpinSemaphore {
    taken: AtomicBool,
}

impl SpinSemaphore {
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
        }
    }
}

impl Semaphore for SpinSemaphore {
    fn try_acquire(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.taken.store(false, Ordering::Release);
    }
}

/// Lock-free [ThreadFlags]
///
/// [wait](ThreadFlags::wait) spins, so a real RTOS port should prefer its native
/// thread flags. Tests and bare-metal super loops poll with [take](EventFlags::take).
#[derive(Default)]
pub struct EventFlags {
    pending: AtomicU32,
}

impl EventFlags {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    /// Returns and clears all pending flags without blocking
    pub fn take(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }
}

impl ThreadFlags for EventFlags {
    fn set(&self, flags: u32) {
        self.pending.fetch_or(flags, Ordering::AcqRel);
    }

    fn wait(&self) -> u32 {
        loop {
            let flags = self.take();
            if flags != 0 {
                return flags;
            }
            core::hint::spin_loop();
        }
    }
}

/// [Delay] that returns immediately
///
/// Useful when the driver and the locks are known to never report contention.
#[derive(Default, Copy, Clone)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay_ms(&self, _ms: u32) {}
}
