//! Monotonic device time.

use std::time::Instant;

/// Time since node start. Millisecond readings wrap at `u32::MAX`
/// (about 49.7 days), like a device tick counter.
#[derive(Debug, Clone, Copy)]
pub struct Uptime(Instant);

impl Uptime {
    pub fn start() -> Self {
        Uptime(Instant::now())
    }

    pub fn millis(&self) -> u32 {
        (self.0.elapsed().as_millis() & u128::from(u32::MAX)) as u32
    }

    pub fn secs(&self) -> u32 {
        self.0.elapsed().as_secs().min(u64::from(u32::MAX)) as u32
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self::start()
    }
}
