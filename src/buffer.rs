/// file: src/buffer.rs
/// description: bounded newest-first event buffer and the size/time batch accumulator
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MAX_EVENTS: usize = 500;
pub const DEFAULT_RETAINED_EVENTS: usize = 400;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_BATCH_AGE: Duration = Duration::from_millis(300);

/// Recent events, newest batch first.
///
/// Inserting past `max_len` truncates to `retain_len`, dropping the oldest
/// entries, so the length never exceeds `max_len` after an insertion.
#[derive(Debug, Clone)]
pub struct EventBuffer<T> {
    items: VecDeque<Arc<T>>,
    max_len: usize,
    retain_len: usize,
    truncations: u64,
}

impl<T> Default for EventBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_RETAINED_EVENTS)
    }
}

impl<T> EventBuffer<T> {
    pub fn new(max_len: usize, retain_len: usize) -> Self {
        debug_assert!(retain_len <= max_len);
        Self {
            items: VecDeque::with_capacity(max_len),
            max_len,
            retain_len,
            truncations: 0,
        }
    }

    /// Prepend a batch, keeping the batch's own order. Returns true when the
    /// insertion triggered a truncation.
    pub fn prepend_batch(&mut self, batch: Vec<Arc<T>>) -> bool {
        for item in batch.into_iter().rev() {
            self.items.push_front(item);
        }

        if self.items.len() > self.max_len {
            self.items.truncate(self.retain_len);
            self.truncations += 1;
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn truncations(&self) -> u64 {
        self.truncations
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<Arc<T>> {
        self.items.iter().cloned().collect()
    }
}

/// Hybrid size/time flush rule, evaluated only when a message arrives.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_age: DEFAULT_MAX_BATCH_AGE,
        }
    }
}

impl BatchPolicy {
    /// No previous flush counts as "too long ago".
    pub fn should_flush(&self, pending: usize, last_flush: Option<Instant>, now: Instant) -> bool {
        if pending >= self.max_batch_size {
            return true;
        }
        match last_flush {
            Some(at) => now.saturating_duration_since(at) > self.max_batch_age,
            None => true,
        }
    }
}

/// Events received but not yet published into the buffer.
#[derive(Debug)]
pub struct PendingBatch<T> {
    items: Vec<Arc<T>>,
}

impl<T> Default for PendingBatch<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> PendingBatch<T> {
    pub fn push(&mut self, item: Arc<T>) {
        self.items.push(item);
    }

    pub fn take(&mut self) -> Vec<Arc<T>> {
        std::mem::take(&mut self.items)
    }

    pub fn discard(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(range: std::ops::Range<u32>) -> Vec<Arc<u32>> {
        range.map(Arc::new).collect()
    }

    fn values(buffer: &EventBuffer<u32>) -> Vec<u32> {
        buffer.iter().map(|v| **v).collect()
    }

    #[test]
    fn newest_batch_goes_first_with_internal_order_kept() {
        let mut buffer = EventBuffer::default();
        buffer.prepend_batch(batch(0..3));
        buffer.prepend_batch(batch(3..5));

        assert_eq!(values(&buffer), vec![3, 4, 0, 1, 2]);
    }

    #[test]
    fn exceeding_cap_truncates_to_retained_count() {
        let mut buffer = EventBuffer::new(500, 400);
        for start in (0..490).step_by(10) {
            assert!(!buffer.prepend_batch(batch(start..start + 10)));
        }
        assert_eq!(buffer.len(), 490);

        // landing exactly on the cap is fine
        assert!(!buffer.prepend_batch(batch(490..500)));
        assert_eq!(buffer.len(), 500);

        assert!(buffer.prepend_batch(batch(500..501)));
        assert_eq!(buffer.len(), 400);
        assert_eq!(buffer.truncations(), 1);
        // the oldest entries are the ones dropped
        assert_eq!(buffer.iter().next().map(|v| **v), Some(500));
        assert_eq!(buffer.iter().last().map(|v| **v), Some(108));
    }

    #[test]
    fn length_bounds_hold_for_mixed_batch_sizes() {
        let mut buffer = EventBuffer::new(500, 400);
        let mut next = 0;
        for size in [1u32, 7, 10, 3, 10, 10, 2, 9].iter().cycle().take(400) {
            let truncated = buffer.prepend_batch(batch(next..next + size));
            next += size;
            assert!(buffer.len() <= 500);
            if truncated {
                assert!(buffer.len() <= 400);
            }
        }
        assert!(buffer.truncations() > 0);
    }

    #[test]
    fn flush_rule_uses_size_or_elapsed_time() {
        let policy = BatchPolicy::default();
        let start = Instant::now();

        assert!(policy.should_flush(1, None, start));
        assert!(!policy.should_flush(1, Some(start), start + Duration::from_millis(300)));
        assert!(policy.should_flush(1, Some(start), start + Duration::from_millis(301)));
        assert!(policy.should_flush(10, Some(start), start));
        assert!(!policy.should_flush(9, Some(start), start + Duration::from_millis(10)));
    }

    #[test]
    fn pending_batch_take_clears() {
        let mut pending = PendingBatch::default();
        pending.push(Arc::new(1));
        pending.push(Arc::new(2));

        assert_eq!(pending.take().len(), 2);
        assert!(pending.is_empty());

        pending.push(Arc::new(3));
        assert_eq!(pending.discard(), 1);
        assert_eq!(pending.len(), 0);
    }
}
