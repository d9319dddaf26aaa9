use super::replacer::{FrameId, Replacer};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Least-recently-unpinned eviction.
///
/// Every unpin stamps the frame with a fresh tick; the smallest tick is the
/// victim. Released frames hold no page and go first.
#[derive(Debug)]
pub struct LruReplacer {
    by_tick: BTreeMap<u64, FrameId>,
    ticks: HashMap<FrameId, u64>,
    released: VecDeque<FrameId>,
    next_tick: u64,
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            by_tick: BTreeMap::new(),
            ticks: HashMap::with_capacity(max_size),
            released: VecDeque::new(),
            next_tick: 0,
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        if let Some(frame_id) = self.released.pop_front() {
            return Some(frame_id);
        }
        let (_, frame_id) = self.by_tick.pop_first()?;
        self.ticks.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some(tick) = self.ticks.remove(&frame_id) {
            self.by_tick.remove(&tick);
        }
        self.released.retain(|released| *released != frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.ticks.contains_key(&frame_id)
            || self.released.contains(&frame_id)
            || self.size() >= self.max_size
        {
            return;
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.by_tick.insert(tick, frame_id);
        self.ticks.insert(frame_id, tick);
    }

    fn release(&mut self, frame_id: FrameId) {
        self.pin(frame_id);
        self.released.push_back(frame_id);
    }

    fn size(&self) -> usize {
        self.ticks.len() + self.released.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_unpinned() {
        let mut replacer = LruReplacer::new(3);
        assert_eq!(replacer.evict(), None);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_pinned_frames_are_skipped() {
        let mut replacer = LruReplacer::new(3);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);

        replacer.pin(999);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_repin_moves_frame_to_the_back() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        replacer.pin(2);
        replacer.unpin(2);
        replacer.unpin(4);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(4));
    }

    #[test]
    fn test_released_frames_go_first() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.release(2);
        replacer.release(3);
        assert_eq!(replacer.size(), 3);

        // Already a candidate through release.
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_duplicate_unpin_and_capacity() {
        let mut replacer = LruReplacer::new(2);
        replacer.unpin(1);
        replacer.unpin(1);
        assert_eq!(replacer.size(), 1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 2);
    }
}
