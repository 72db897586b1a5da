use super::replacer::{FrameId, Replacer};
use std::collections::{BTreeMap, HashMap};

/// Least-recently-unpinned eviction.
///
/// Every unpin stamps the frame with a logical clock tick; the frame with the
/// oldest tick is the next victim.
#[derive(Debug)]
pub struct LruReplacer {
    by_tick: BTreeMap<u64, FrameId>,
    ticks: HashMap<FrameId, u64>,
    clock: u64,
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            by_tick: BTreeMap::new(),
            ticks: HashMap::with_capacity(max_size),
            clock: 0,
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        let (_, frame_id) = self.by_tick.pop_first()?;
        self.ticks.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some(tick) = self.ticks.remove(&frame_id) {
            self.by_tick.remove(&tick);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.ticks.contains_key(&frame_id) || self.ticks.len() >= self.max_size {
            return;
        }
        self.clock += 1;
        self.ticks.insert(frame_id, self.clock);
        self.by_tick.insert(self.clock, frame_id);
    }

    fn size(&self) -> usize {
        self.ticks.len()
    }
}
