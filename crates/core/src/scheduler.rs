use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::domain::AssetId;
use crate::source::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
}

#[derive(Default)]
struct Queues {
    high: VecDeque<AssetId>,
    normal: VecDeque<AssetId>,
    pending: HashMap<AssetId, Priority>,
}

/// Two-level FIFO of asset ids awaiting analysis, deduplicated by id.
#[derive(Default)]
pub struct AnalysisScheduler {
    queues: Mutex<Queues>,
}

impl AnalysisScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue ids at `priority`. A `normal` id re-queued at `high` moves to
    /// the head of the high queue; a `high` id ignores later `normal` requests.
    /// Returns how many ids were newly queued or promoted.
    pub fn enqueue<I>(&self, ids: I, priority: Priority) -> usize
    where
        I: IntoIterator<Item = AssetId>,
    {
        let mut q = lock(&self.queues);
        let mut touched = 0;
        for id in ids {
            match (q.pending.get(&id).copied(), priority) {
                (None, Priority::High) => {
                    q.pending.insert(id.clone(), Priority::High);
                    q.high.push_back(id);
                    touched += 1;
                }
                (None, Priority::Normal) => {
                    q.pending.insert(id.clone(), Priority::Normal);
                    q.normal.push_back(id);
                    touched += 1;
                }
                (Some(Priority::Normal), Priority::High) => {
                    q.normal.retain(|queued| queued != &id);
                    q.pending.insert(id.clone(), Priority::High);
                    q.high.push_front(id);
                    touched += 1;
                }
                (Some(_), _) => {}
            }
        }
        touched
    }

    /// Drain up to `limit` ids, exhausting `high` before `normal`.
    pub fn next_batch(&self, limit: usize) -> Vec<AssetId> {
        let mut q = lock(&self.queues);
        let mut batch = Vec::with_capacity(limit.min(q.pending.len()));
        while batch.len() < limit {
            let next = match q.high.pop_front() {
                Some(id) => Some(id),
                None => q.normal.pop_front(),
            };
            match next {
                Some(id) => {
                    q.pending.remove(&id);
                    batch.push(id);
                }
                None => break,
            }
        }
        batch
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.queues).pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.queues).pending.len()
    }

    /// Drop queued ids that no longer exist.
    pub fn forget(&self, ids: &[AssetId]) {
        let mut q = lock(&self.queues);
        for id in ids {
            if q.pending.remove(id).is_some() {
                q.high.retain(|queued| queued != id);
                q.normal.retain(|queued| queued != id);
            }
        }
    }

    pub fn reset(&self) {
        *lock(&self.queues) = Queues::default();
    }
}
