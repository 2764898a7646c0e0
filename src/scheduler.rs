// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Round-robin job assignment over the slot pool.
//!
//! The scheduler owns one queue sender per slot worker and a monotonically
//! advancing cursor. Assigning a job is a single atomic cursor advance plus
//! a lock-free queue push: O(1), never blocking, and the only shared-state
//! step in the whole submission path. Jobs execute later on their slot's
//! worker; chaining itself cannot fail, so failures surface to whoever
//! awaits the job's reply channel.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::error::{CatapultError, CatapultResult};
use crate::slot::Job;

/// Assigns incoming jobs to slots round-robin, preserving per-slot FIFO
/// order.
pub(crate) struct SlotScheduler {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    cursor: AtomicUsize,
}

impl SlotScheduler {
    pub(crate) fn new(senders: Vec<mpsc::UnboundedSender<Job>>) -> Self {
        debug_assert!(!senders.is_empty());
        Self {
            senders,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of slots being scheduled over.
    pub(crate) fn slot_count(&self) -> usize {
        self.senders.len()
    }

    /// Queue a job on the next slot in cyclic order; returns the slot index
    /// it landed on.
    ///
    /// The cursor wraps at `usize::MAX`; the one-off skip in the cycle
    /// there is harmless.
    pub(crate) fn assign(&self, job: Job) -> CatapultResult<usize> {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.assign_to(slot, job)?;
        Ok(slot)
    }

    /// Queue a job on a specific slot, preserving that slot's FIFO order.
    ///
    /// Used for the targeted receive calls of the slicing overflow path and
    /// for drain barriers.
    pub(crate) fn assign_to(&self, slot: usize, job: Job) -> CatapultResult<()> {
        self.senders[slot]
            .send(job)
            .map_err(|_| CatapultError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn drain_job() -> (Job, oneshot::Receiver<()>) {
        let (done, rx) = oneshot::channel();
        (Job::Drain { done }, rx)
    }

    #[tokio::test]
    async fn test_assign_cycles_through_slots() {
        let (senders, mut receivers): (Vec<_>, Vec<_>) =
            (0..4).map(|_| mpsc::unbounded_channel()).unzip();
        let scheduler = SlotScheduler::new(senders);

        let mut slots = Vec::new();
        for _ in 0..10 {
            let (job, _rx) = drain_job();
            slots.push(scheduler.assign(job).unwrap());
        }
        assert_eq!(slots, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);

        // Each job landed on the queue of the slot it was reported on.
        for (slot, rx) in receivers.iter_mut().enumerate() {
            let expected = slots.iter().filter(|&&s| s == slot).count();
            let mut seen = 0;
            while rx.try_recv().is_ok() {
                seen += 1;
            }
            assert_eq!(seen, expected, "slot {slot}");
        }
    }

    #[tokio::test]
    async fn test_assign_to_targets_one_slot() {
        let (senders, mut receivers): (Vec<_>, Vec<_>) =
            (0..2).map(|_| mpsc::unbounded_channel()).unzip();
        let scheduler = SlotScheduler::new(senders);

        let (job, _rx) = drain_job();
        scheduler.assign_to(1, job).unwrap();
        assert!(receivers[0].try_recv().is_err());
        assert!(receivers[1].try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_assign_after_worker_gone_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let scheduler = SlotScheduler::new(vec![tx]);
        let (job, _rx) = drain_job();
        assert!(matches!(
            scheduler.assign(job),
            Err(CatapultError::SessionClosed)
        ));
    }
}
