//! Process-wide Lamport clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic logical clock: advanced on every local state change and on
/// every received version, so versions from different nodes are totally
/// orderable.
#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Local event: `v + 1`.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Received version: the clock becomes `1 + max(v, received)`.
    pub fn observe(&self, received: u64) -> u64 {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            let next = current.max(received) + 1;
            if self
                .0
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LamportClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
    }

    #[test]
    fn observe_is_one_past_the_maximum() {
        let clock = LamportClock::new();
        clock.tick(); // v = 1
        assert_eq!(clock.observe(10), 11); // 1 + max(1, 10)
        assert_eq!(clock.observe(3), 12); // 1 + max(11, 3)
        assert_eq!(clock.tick(), 13);
    }

    #[test]
    fn observe_under_contention_stays_monotonic() {
        use std::sync::Arc;
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let clock = clock.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for k in 0..1_000u64 {
                        let v = clock.observe(i * 1_000 + k);
                        assert!(v > last);
                        last = v;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(clock.current() >= 8_000);
    }
}
