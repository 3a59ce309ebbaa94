//! Buffer for remote candidates that arrive before the remote description.
//!
//! Candidates are held in arrival order until [`CandidateQueue::drain_into`]
//! runs, which applies each one exactly once. After that the queue is a
//! pass-through: [`CandidateQueue::enqueue`] hands candidates straight back.

use crate::media::IceCandidate;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;

/// Outcome of offering a candidate to the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Held until the remote description is applied.
    Queued,
    /// Remote description already applied, apply this now.
    PassThrough(IceCandidate),
}

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) -> Admission {
        if self.drained {
            Admission::PassThrough(candidate)
        } else {
            self.pending.push_back(candidate);
            Admission::Queued
        }
    }

    /// Apply every queued candidate in FIFO order and switch to pass-through.
    ///
    /// Failures are logged and skipped; a candidate that no longer applies is
    /// usually stale rather than fatal. Returns how many applied cleanly.
    pub async fn drain_into<F, Fut, E>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.drained = true;
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match apply(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(error = %e, "Dropping queued candidate"),
            }
        }
        applied
    }

    /// Discard anything still queued (teardown).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }
}
