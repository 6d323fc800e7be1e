use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, Result, StrataError, Timestamp};

/// Access history for a single tracked frame
#[derive(Debug)]
struct LruKNode {
    /// Last k access timestamps (most recent at back)
    history: VecDeque<Timestamp>,
    /// Total number of recorded accesses
    access_count: usize,
    is_evictable: bool,
}

impl LruKNode {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            access_count: 0,
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        self.access_count += 1;
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Ordering key inside the owning list.
    ///
    /// With fewer than k accesses this is the first access; otherwise the
    /// history is trimmed to k entries, so the front is the k-th most recent.
    fn order_key(&self) -> Timestamp {
        self.history.front().copied().unwrap_or(Timestamp::MAX)
    }

    fn in_history(&self, k: usize) -> bool {
        self.access_count >= k
    }
}

/// Everything guarded by the replacer latch
#[derive(Debug, Default)]
struct ReplacerState {
    current_timestamp: Timestamp,
    nodes: HashMap<FrameId, LruKNode>,
    /// Evictable frames with fewer than k accesses, oldest first
    young: VecDeque<FrameId>,
    /// Evictable frames with at least k accesses, by k-th access ascending
    history: VecDeque<FrameId>,
}

impl ReplacerState {
    fn list_for(&mut self, frame_id: FrameId, k: usize) -> Option<&mut VecDeque<FrameId>> {
        let node = self.nodes.get(&frame_id)?;
        if node.in_history(k) {
            Some(&mut self.history)
        } else {
            Some(&mut self.young)
        }
    }

    fn unlink(&mut self, frame_id: FrameId, k: usize) {
        if let Some(list) = self.list_for(frame_id, k) {
            if let Some(pos) = list.iter().position(|f| *f == frame_id) {
                list.remove(pos);
            }
        }
    }

    /// Inserts the frame at its ordered position in the list it belongs to.
    fn link(&mut self, frame_id: FrameId, k: usize) {
        let Some(node) = self.nodes.get(&frame_id) else {
            return;
        };
        let key = node.order_key();
        let list = if node.in_history(k) {
            &mut self.history
        } else {
            &mut self.young
        };
        let nodes = &self.nodes;
        let pos = list.partition_point(|f| {
            nodes
                .get(f)
                .map(|n| n.order_key() < key)
                .unwrap_or(false)
        });
        list.insert(pos, frame_id);
    }
}

/// LRU-K Replacement Policy
///
/// Frames with fewer than k recorded accesses have an infinite backward
/// k-distance and always go before any frame with a full history; among
/// them the earliest first access loses. Frames with a full history are
/// evicted by the oldest k-th most recent access.
///
/// Only evictable frames are linked into the young or history list, so
/// eviction is a pop from the front of one of them.
pub struct LruKReplacer {
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer with the given k value and maximum frame count.
    pub fn new(k: usize, max_frames: usize) -> Self {
        Self {
            k: k.max(1),
            max_frames,
            state: Mutex::new(ReplacerState::default()),
        }
    }

    /// Evicts the least valuable evictable frame and drops its history.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        let victim = match state.young.pop_front() {
            Some(frame_id) => frame_id,
            None => state.history.pop_front()?,
        };
        state.nodes.remove(&victim);
        Some(victim)
    }

    /// Records that the given frame was accessed at the current timestamp.
    ///
    /// The first access creates a non-evictable tracking node. An evictable
    /// frame is moved to its new position; a pinned one only has its counters
    /// updated.
    pub fn record_access(&self, frame_id: FrameId) -> Result<()> {
        if frame_id.as_usize() >= self.max_frames {
            return Err(StrataError::InvalidFrameId(frame_id));
        }

        let k = self.k;
        let mut state = self.state.lock();
        let timestamp = state.current_timestamp;
        state.current_timestamp += 1;

        let is_evictable = state
            .nodes
            .get(&frame_id)
            .map(|n| n.is_evictable)
            .unwrap_or(false);

        if is_evictable {
            state.unlink(frame_id, k);
        }
        state
            .nodes
            .entry(frame_id)
            .or_insert_with(LruKNode::new)
            .record_access(timestamp, k);
        if is_evictable {
            state.link(frame_id, k);
        }
        Ok(())
    }

    /// Sets whether a frame is evictable.
    ///
    /// Unknown frames are ignored, as is a call that does not change the state.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        let k = self.k;
        let mut state = self.state.lock();

        let Some(node) = state.nodes.get_mut(&frame_id) else {
            return;
        };
        if node.is_evictable == is_evictable {
            return;
        }

        if is_evictable {
            node.is_evictable = true;
            state.link(frame_id, k);
        } else {
            state.unlink(frame_id, k);
            if let Some(node) = state.nodes.get_mut(&frame_id) {
                node.is_evictable = false;
            }
        }
    }

    /// Drops all tracking state for a frame, used when its page is deleted.
    ///
    /// Removing an untracked frame is a no-op; removing a pinned one is a
    /// caller bug and reported as `FrameNotEvictable`.
    pub fn remove(&self, frame_id: FrameId) -> Result<()> {
        let k = self.k;
        let mut state = self.state.lock();

        match state.nodes.get(&frame_id) {
            None => Ok(()),
            Some(node) if !node.is_evictable => Err(StrataError::FrameNotEvictable(frame_id)),
            Some(_) => {
                state.unlink(frame_id, k);
                state.nodes.remove(&frame_id);
                Ok(())
            }
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.young.len() + state.history.len()
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}
