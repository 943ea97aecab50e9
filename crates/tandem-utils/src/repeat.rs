use std::time::{Duration, Instant};

/// Fires at most once per interval. Drives reconnect attempts, idle pings
/// and the ack watchdog without spinning a timer thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Repeater {
    interval: Duration,
    /// `None` means the next check fires unconditionally.
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    /// True once per elapsed interval; arming happens on the firing call.
    #[inline]
    pub fn fired(&mut self) -> bool {
        match self.last_acted {
            Some(t) if t.elapsed() < self.interval => false,
            _ => {
                self.last_acted = Some(Instant::now());
                true
            }
        }
    }

    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(),
    {
        if self.fired() {
            f();
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Push the next firing a full interval out.
    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    /// Make the next `fired` call return true regardless of elapsed time.
    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}
