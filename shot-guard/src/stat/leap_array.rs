use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use super::BucketGenerator;
use crate::error::GuardError;
use crate::error::Result;

#[inline]
pub(crate) fn calculate_window_start(now_ms: u64, window_length_ms: u64) -> u64 {
    now_ms - now_ms % window_length_ms
}

/// One time slice: where it starts, how long it is, and its payload.
pub struct WindowWrap<B> {
    window_length_ms: u64,
    window_start: AtomicU64,
    value: B,
}

impl<B> WindowWrap<B> {
    fn new(window_length_ms: u64, window_start: u64, value: B) -> Self {
        Self {
            window_length_ms,
            window_start: AtomicU64::new(window_start),
            value,
        }
    }

    #[inline]
    pub fn window_start(&self) -> u64 {
        self.window_start.load(Ordering::Acquire)
    }

    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    #[inline]
    pub fn value(&self) -> &B {
        &self.value
    }

    pub fn is_time_in_window(&self, time_ms: u64) -> bool {
        let start = self.window_start();
        start <= time_ms && time_ms < start + self.window_length_ms
    }

    /// A slice whose start is a full interval (or more) behind `now_ms` no longer counts.
    #[inline]
    pub fn is_deprecated(&self, now_ms: u64, interval_ms: u64) -> bool {
        now_ms.saturating_sub(self.window_start()) >= interval_ms
    }
}

impl<B: fmt::Debug> fmt::Debug for WindowWrap<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowWrap")
            .field("window_length_ms", &self.window_length_ms)
            .field("window_start", &self.window_start())
            .field("value", &self.value)
            .finish()
    }
}

/// A fixed ring of `sample_count` slices covering `interval_ms`.
///
/// A time maps to slot `(t / window_length_ms) % sample_count`. Slots are
/// installed once and then recycled in place when their slice rotates out, so
/// memory is bounded by `sample_count` regardless of uptime. The update lock
/// only guards recycling; counter updates on a live bucket never take it.
pub struct LeapArray<G: BucketGenerator> {
    window_length_ms: u64,
    sample_count: u32,
    interval_ms: u64,
    array: Box<[OnceLock<WindowWrap<G::Bucket>>]>,
    update_lock: Mutex<()>,
    generator: G,
}

impl<G: BucketGenerator> LeapArray<G> {
    pub fn new(sample_count: u32, interval_ms: u32, generator: G) -> Result<Self> {
        if sample_count == 0 || interval_ms == 0 {
            return Err(GuardError::InvalidStatParams(format!(
                "sample_count ({sample_count}) and interval_ms ({interval_ms}) must be positive"
            )));
        }
        if interval_ms % sample_count != 0 {
            return Err(GuardError::InvalidStatParams(format!(
                "interval_ms ({interval_ms}) is not a multiple of sample_count ({sample_count})"
            )));
        }

        let array = (0..sample_count).map(|_| OnceLock::new()).collect();
        Ok(Self {
            window_length_ms: (interval_ms / sample_count) as u64,
            sample_count,
            interval_ms: interval_ms as u64,
            array,
            update_lock: Mutex::new(()),
            generator,
        })
    }

    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    #[inline]
    fn time_index(&self, now_ms: u64) -> usize {
        ((now_ms / self.window_length_ms) % self.sample_count as u64) as usize
    }

    /// The slice covering `now_ms`, installing or recycling its slot as needed.
    ///
    /// # Errors
    ///
    /// `GuardError::ClockBackwards` if the slot already holds a newer slice
    /// than the one `now_ms` belongs to.
    pub fn current_window_with_time(&self, now_ms: u64) -> Result<&WindowWrap<G::Bucket>> {
        let idx = self.time_index(now_ms);
        let window_start = calculate_window_start(now_ms, self.window_length_ms);
        let slot = &self.array[idx];

        loop {
            let wrap = slot.get_or_init(|| {
                WindowWrap::new(
                    self.window_length_ms,
                    window_start,
                    self.generator.new_empty_bucket(),
                )
            });

            let stored = wrap.window_start();
            if stored == window_start {
                return Ok(wrap);
            }
            if stored > window_start {
                return Err(GuardError::ClockBackwards {
                    now_ms,
                    window_start: stored,
                });
            }

            // The slot holds an expired slice. One caller recycles it, the rest
            // yield and re-read.
            match self.update_lock.try_lock() {
                Some(_guard) => {
                    if wrap.window_start() < window_start {
                        self.generator.reset_bucket(wrap.value());
                        wrap.window_start.store(window_start, Ordering::Release);
                    }
                }
                None => std::thread::yield_now(),
            }
        }
    }

    /// All installed slices still inside the interval ending at `now_ms`.
    pub fn values_with_time(&self, now_ms: u64) -> Vec<&WindowWrap<G::Bucket>> {
        self.values_conditional(now_ms, |_| true)
    }

    /// As `values_with_time`, additionally filtered on each slice's start.
    pub fn values_conditional<P>(&self, now_ms: u64, predicate: P) -> Vec<&WindowWrap<G::Bucket>>
    where
        P: Fn(u64) -> bool,
    {
        self.array
            .iter()
            .filter_map(OnceLock::get)
            .filter(|wrap| {
                !wrap.is_deprecated(now_ms, self.interval_ms) && predicate(wrap.window_start())
            })
            .collect()
    }
}

impl<G: BucketGenerator> fmt::Debug for LeapArray<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeapArray")
            .field("window_length_ms", &self.window_length_ms)
            .field("sample_count", &self.sample_count)
            .field("interval_ms", &self.interval_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct CounterGenerator;

    impl BucketGenerator for CounterGenerator {
        type Bucket = AtomicU64;

        fn new_empty_bucket(&self) -> AtomicU64 {
            AtomicU64::new(0)
        }

        fn reset_bucket(&self, bucket: &AtomicU64) {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    fn array() -> LeapArray<CounterGenerator> {
        // 5 x 200ms
        LeapArray::new(5, 1_000, CounterGenerator).unwrap()
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(matches!(
            LeapArray::new(0, 1_000, CounterGenerator),
            Err(GuardError::InvalidStatParams(_))
        ));
        assert!(matches!(
            LeapArray::new(3, 1_000, CounterGenerator),
            Err(GuardError::InvalidStatParams(_))
        ));
    }

    #[test]
    fn same_slice_returns_same_wrap() {
        let arr = array();
        let a = arr.current_window_with_time(1_210).unwrap();
        let b = arr.current_window_with_time(1_399).unwrap();

        assert!(std::ptr::eq(a, b));
        assert_eq!(a.window_start(), 1_200);
        assert!(a.is_time_in_window(1_200));
        assert!(!a.is_time_in_window(1_400));
    }

    #[test]
    fn rotation_recycles_slot_in_place() {
        let arr = array();
        let first = arr.current_window_with_time(200).unwrap();
        first.value().fetch_add(7, Ordering::Relaxed);

        // One full interval later the same slot is reused for the new slice
        let second = arr.current_window_with_time(1_250).unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(second.window_start(), 1_200);
        assert_eq!(second.value().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn clock_going_backwards_is_an_error() {
        let arr = array();
        arr.current_window_with_time(1_200).unwrap();

        let err = arr.current_window_with_time(200).unwrap_err();
        assert_eq!(
            err,
            GuardError::ClockBackwards {
                now_ms: 200,
                window_start: 1_200
            }
        );
    }

    #[test]
    fn values_skip_empty_and_expired_slots() {
        let arr = array();
        assert!(arr.values_with_time(0).is_empty());

        arr.current_window_with_time(0).unwrap();
        arr.current_window_with_time(400).unwrap();
        arr.current_window_with_time(800).unwrap();
        assert_eq!(arr.values_with_time(800).len(), 3);

        // At 1000 the slice starting at 0 is a full interval old
        assert_eq!(arr.values_with_time(1_000).len(), 2);
        assert_eq!(arr.values_conditional(800, |start| start >= 400).len(), 2);
    }

    #[test]
    fn concurrent_first_touch_installs_once() {
        use std::sync::Arc;
        use std::thread;

        let arr = Arc::new(array());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let arr = Arc::clone(&arr);
                thread::spawn(move || {
                    let wrap = arr.current_window_with_time(600).unwrap();
                    wrap.value().fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let values = arr.values_with_time(600);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value().load(Ordering::Relaxed), 16);
    }
}
