// Licensed under the Apache-2.0 license

pub type Ticks = u64;

/// Free-running machine timer.
pub trait Clock {
    fn now(&self) -> Ticks;

    fn ticks_per_sec(&self) -> Ticks;

    /// True once strictly more than `duration` ticks have passed since `start`.
    fn is_elapsed(&self, start: Ticks, duration: Ticks) -> bool {
        self.now().saturating_sub(start) > duration
    }

    fn secs(&self, secs: u64) -> Ticks {
        secs.saturating_mul(self.ticks_per_sec())
    }
}
