//! Admission & Queue Manager
//!
//! Bounded-parallelism admission with a strict FIFO waiting queue. This type
//! only counts and orders; the supervisor applies the matching job state
//! transitions while holding its lock.

use crate::application::constants::{MAX_CAPACITY, MIN_CAPACITY};
use crate::domain::JobId;
use crate::error::{AppError, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::debug;

/// Waiting queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub descriptor_path: PathBuf,
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; the caller must start the job
    Start,
    /// Capacity reached; 1-based position in the waiting queue
    Enqueued { position: usize },
}

#[derive(Debug)]
pub struct AdmissionManager {
    capacity: usize,
    active: usize,
    waiting: VecDeque<QueuedJob>,
}

impl AdmissionManager {
    pub fn new(capacity: usize) -> Result<Self> {
        Self::validate_capacity(capacity)?;
        Ok(Self {
            capacity,
            active: 0,
            waiting: VecDeque::new(),
        })
    }

    pub fn validate_capacity(capacity: usize) -> Result<()> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(AppError::InvalidCapacity {
                requested: capacity,
                min: MIN_CAPACITY,
                max: MAX_CAPACITY,
            });
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs holding a slot (running, not yet terminal)
    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn queued_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn waiting(&self) -> impl Iterator<Item = &QueuedJob> {
        self.waiting.iter()
    }

    pub fn is_queued(&self, job_id: &JobId) -> bool {
        self.waiting.iter().any(|q| &q.job_id == job_id)
    }

    pub fn submit(&mut self, job: QueuedJob) -> Admission {
        if self.active < self.capacity {
            self.active += 1;
            Admission::Start
        } else {
            self.waiting.push_back(job);
            Admission::Enqueued {
                position: self.waiting.len(),
            }
        }
    }

    /// Give back the slot of a job that reached a terminal state
    pub fn release(&mut self) {
        debug_assert!(self.active > 0, "release without an active job");
        self.active = self.active.saturating_sub(1);
    }

    /// Take queued jobs from the front while slots are free.
    ///
    /// Every returned job already holds a slot.
    pub fn promote(&mut self) -> Vec<QueuedJob> {
        let mut promoted = Vec::new();
        while self.active < self.capacity {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            self.active += 1;
            promoted.push(next);
        }
        if !promoted.is_empty() {
            debug!(
                promoted = promoted.len(),
                active = self.active,
                capacity = self.capacity,
                "Promoted queued jobs"
            );
        }
        promoted
    }

    /// Release one slot and refill from the queue
    pub fn on_job_terminal(&mut self) -> Vec<QueuedJob> {
        self.release();
        self.promote()
    }

    /// Remove a job from the waiting queue; false if it was not queued
    pub fn cancel(&mut self, job_id: &JobId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|q| &q.job_id != job_id);
        self.waiting.len() != before
    }

    /// Change the capacity; refused values keep the previous one.
    ///
    /// Lowering below the active count never evicts running jobs, it only
    /// holds back promotions.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<Vec<QueuedJob>> {
        Self::validate_capacity(capacity)?;
        self.capacity = capacity;
        Ok(self.promote())
    }
}
