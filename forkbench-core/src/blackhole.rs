//! Blackhole
//!
//! Sink for benchmark results so the optimizer cannot prove them unused.

use std::hint::black_box;

/// Value sink with an optional CPU cost per consumed value
#[derive(Debug, Default)]
pub struct Blackhole {
    tokens: u64,
    consumed: u64,
    sink: u64,
}

impl Blackhole {
    /// Sink without extra cost
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that burns `tokens` dependent arithmetic steps per consumed value
    pub fn with_cost(tokens: u64) -> Self {
        Self {
            tokens,
            ..Self::default()
        }
    }

    /// Swallow `value`.
    ///
    /// The value is dropped here, so its destructor runs inside the timed
    /// window. Consumption never counts as an operation.
    #[inline]
    pub fn consume<T>(&mut self, value: T) {
        drop(black_box(value));
        self.consumed = self.consumed.wrapping_add(1);
        if self.tokens > 0 {
            self.sink ^= Self::consume_cpu(self.tokens);
        }
    }

    /// Burn roughly `tokens` units of CPU that cannot be optimized away
    #[inline(never)]
    pub fn consume_cpu(tokens: u64) -> u64 {
        // xorshift steps, each depending on the previous one
        let mut state = black_box(0x9E37_79B9_7F4A_7C15u64);
        for _ in 0..tokens {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
        }
        black_box(state)
    }

    /// Values consumed so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Configured cost per value
    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

impl Drop for Blackhole {
    fn drop(&mut self) {
        black_box(self.sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_consume_counts_values() {
        let mut bh = Blackhole::new();
        bh.consume(42u64);
        bh.consume("text");
        bh.consume(vec![1, 2, 3]);
        assert_eq!(bh.consumed(), 3);
    }

    #[test]
    fn test_consume_drops_the_value() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut bh = Blackhole::new();
        bh.consume(Tracked(drops.clone()));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_consume_cpu_is_deterministic() {
        assert_eq!(Blackhole::consume_cpu(100), Blackhole::consume_cpu(100));
        assert_ne!(Blackhole::consume_cpu(0), Blackhole::consume_cpu(1));
    }

    #[test]
    fn test_with_cost() {
        let mut bh = Blackhole::with_cost(1_000);
        assert_eq!(bh.tokens(), 1_000);
        bh.consume(());
        assert_eq!(bh.consumed(), 1);
    }
}
