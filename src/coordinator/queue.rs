//! Work queue with per-worker lanes and stealing.
//!
//! Items are suite indices. Each worker slot owns a lane seeded with a contiguous, balanced slice of the
//! suite. A slot takes from the front of its own lane; when that lane is empty it steals from the back
//! of the longest remaining lane. Removal happens before the item is handed out, so an item is assigned
//! at most once.
//!
//! The queue is owned by the coordinator's control loop; `&mut self` on every mutating call is the single
//! point of mutual exclusion for assignment.

use std::collections::VecDeque;

/// Where an assigned item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Own(usize),
    Stolen { item: usize, from: usize },
}

impl Assignment {
    pub fn item(self) -> usize {
        match self {
            Assignment::Own(item) | Assignment::Stolen { item, .. } => item,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkQueue {
    lanes: Vec<VecDeque<usize>>,
}

impl WorkQueue {
    /// Split `0..items` into `workers` contiguous lanes whose sizes differ by at most one.
    ///
    /// `workers` is clamped to at least one lane.
    pub fn partition(items: usize, workers: usize) -> Self {
        let workers = workers.max(1);
        let base = items / workers;
        let extra = items % workers;

        let mut lanes = Vec::with_capacity(workers);
        let mut next = 0;
        for lane in 0..workers {
            let len = base + usize::from(lane < extra);
            lanes.push((next..next + len).collect());
            next += len;
        }
        Self { lanes }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_len(&self, lane: usize) -> usize {
        self.lanes.get(lane).map_or(0, VecDeque::len)
    }

    /// Items not yet assigned, across all lanes.
    pub fn remaining(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Next item for `lane`: its own front, otherwise the back of the longest other lane.
    pub fn next_for(&mut self, lane: usize) -> Option<Assignment> {
        if let Some(item) = self.lanes.get_mut(lane).and_then(VecDeque::pop_front) {
            return Some(Assignment::Own(item));
        }

        let donor = self
            .lanes
            .iter()
            .enumerate()
            .filter(|(i, l)| *i != lane && !l.is_empty())
            .max_by_key(|(i, l)| (l.len(), std::cmp::Reverse(*i)))
            .map(|(i, _)| i)?;
        let item = self.lanes[donor].pop_back()?;
        Some(Assignment::Stolen { item, from: donor })
    }

    /// Put an item that was never started back at the front of `lane`.
    pub fn requeue(&mut self, lane: usize, item: usize) {
        if let Some(l) = self.lanes.get_mut(lane) {
            l.push_front(item);
        }
    }

    /// Remove and return every unassigned item, in suite order.
    pub fn drain(&mut self) -> Vec<usize> {
        let mut items: Vec<usize> = self.lanes.iter_mut().flat_map(|l| l.drain(..)).collect();
        items.sort_unstable();
        items
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_partition_is_balanced_and_contiguous() {
        let queue = WorkQueue::partition(10, 4);
        let lens: Vec<usize> = (0..4).map(|l| queue.lane_len(l)).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
        assert_eq!(queue.lanes[1], VecDeque::from(vec![3, 4, 5]));
    }

    #[test]
    fn test_more_workers_than_items() {
        let queue = WorkQueue::partition(2, 5);
        assert_eq!(queue.lane_count(), 5);
        assert_eq!(queue.remaining(), 2);
        assert_eq!(WorkQueue::partition(3, 0).lane_count(), 1);
    }

    #[test]
    fn test_own_lane_first_then_steal_from_longest() {
        let mut queue = WorkQueue::partition(7, 3);
        // lanes: [0,1,2] [3,4] [5,6]
        assert_eq!(queue.next_for(2), Some(Assignment::Own(5)));
        assert_eq!(queue.next_for(2), Some(Assignment::Own(6)));
        assert_eq!(queue.next_for(2), Some(Assignment::Stolen { item: 2, from: 0 }));
        assert_eq!(queue.next_for(2), Some(Assignment::Stolen { item: 1, from: 0 }));
        // lanes now: [0] [3,4] []
        assert_eq!(queue.next_for(0), Some(Assignment::Own(0)));
        assert_eq!(queue.next_for(0), Some(Assignment::Stolen { item: 4, from: 1 }));
        assert_eq!(queue.next_for(1), Some(Assignment::Own(3)));
        assert_eq!(queue.next_for(1), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_and_drain() {
        let mut queue = WorkQueue::partition(4, 2);
        let first = queue.next_for(1).unwrap().item();
        assert_eq!(first, 2);
        queue.requeue(1, first);
        assert_eq!(queue.lane_len(1), 2);
        assert_eq!(queue.drain(), vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    proptest! {
        /// Whatever order workers ask in, every item is handed out exactly once.
        #[test]
        fn partition_coverage(
            items in 0usize..200,
            workers in 1usize..16,
            order in proptest::collection::vec(0usize..16, 0..400),
        ) {
            let mut queue = WorkQueue::partition(items, workers);
            let mut seen = vec![0u32; items];

            for lane in order {
                if let Some(a) = queue.next_for(lane % workers) {
                    seen[a.item()] += 1;
                }
            }
            let mut lane = 0;
            while let Some(a) = queue.next_for(lane) {
                seen[a.item()] += 1;
                lane = (lane + 1) % workers;
            }

            prop_assert!(queue.is_empty());
            prop_assert!(seen.iter().all(|&n| n == 1));
        }
    }
}
