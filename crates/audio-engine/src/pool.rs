//! Voice free list and the admission-ordered playing set.

use std::collections::VecDeque;

use crate::hal::{MixerBackend, VoiceId};

/// Voices returned by stopped sounds, kept for reuse instead of deleted.
#[derive(Debug, Default)]
pub struct VoicePool {
    free: Vec<VoiceId>,
}

impl VoicePool {
    pub fn take(&mut self) -> Option<VoiceId> {
        self.free.pop()
    }

    pub fn give(&mut self, voice: VoiceId) {
        debug_assert!(!self.free.contains(&voice));
        self.free.push(voice);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Delete every parked voice on the mixer.
    pub fn destroy_all(&mut self, mixer: &dyn MixerBackend) {
        for voice in self.free.drain(..) {
            if let Err(e) = mixer.delete_voice(voice) {
                tracing::warn!(voice = voice.0, "failed to delete voice: {e}");
            }
        }
    }
}

/// Sounds currently holding a voice, in the order they were admitted.
#[derive(Debug, Default)]
pub struct PlayingSet<K> {
    order: VecDeque<K>,
}

impl<K: Copy + PartialEq> PlayingSet<K> {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
        }
    }

    /// Admit `key`; re-admitting keeps its original position.
    pub fn insert(&mut self, key: K) {
        if !self.contains(key) {
            self.order.push_back(key);
        }
    }

    pub fn remove(&mut self, key: K) -> bool {
        let before = self.order.len();
        self.order.retain(|&k| k != key);
        before != self.order.len()
    }

    pub fn contains(&self, key: K) -> bool {
        self.order.contains(&key)
    }

    /// Earliest admitted member, the first to be evicted.
    pub fn oldest(&self) -> Option<K> {
        self.order.front().copied()
    }

    /// Members to evict, oldest first, so that at most `limit` remain.
    pub fn excess_over(&self, limit: usize) -> Vec<K> {
        let excess = self.order.len().saturating_sub(limit);
        self.order.iter().take(excess).copied().collect()
    }

    pub fn snapshot(&self) -> Vec<K> {
        self.order.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::SoftwareMixer;

    #[test]
    fn playing_set_is_fifo_by_admission() {
        let mut set = PlayingSet::new();
        set.insert(1u64);
        set.insert(2);
        set.insert(1);
        set.insert(3);
        assert_eq!(set.snapshot(), vec![1, 2, 3]);
        assert_eq!(set.oldest(), Some(1));
        assert_eq!(set.excess_over(2), vec![1]);
        assert_eq!(set.excess_over(0), vec![1, 2, 3]);
        assert!(set.excess_over(5).is_empty());

        assert!(set.remove(1));
        assert!(!set.remove(1));
        assert_eq!(set.oldest(), Some(2));
    }

    #[test]
    fn voice_pool_reuses_and_destroys() {
        let mixer = SoftwareMixer::new(8_000, 4);
        let mut pool = VoicePool::default();
        assert!(pool.take().is_none());

        let v = mixer.gen_voice().unwrap();
        pool.give(v);
        assert_eq!(pool.take(), Some(v));
        pool.give(v);
        pool.destroy_all(&mixer);
        assert!(pool.is_empty());
        assert_eq!(mixer.voice_count(), 0);
    }
}
