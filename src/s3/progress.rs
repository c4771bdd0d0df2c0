//! Aggregate progress of an upload.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::types::PartProgress;

/// Progress of a whole upload, across all of its parts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ProgressSnapshot {
    /// Bytes of the source acknowledged by the transport so far.
    pub loaded: u64,
    /// `loaded / total`, in `[0, 1]`.
    pub position: f64,
    pub total: u64,
    /// Bytes per second, measured between the two most recent events.
    pub speed: f64,
}

/// The stage an upload has reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UploadPhase {
    Idle,
    Initiating,
    UploadingParts,
    Completing,
    Done,
    /// The upload stopped. Holds a description of the error.
    Failed(String),
}

impl UploadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadPhase::Done | UploadPhase::Failed(_))
    }
}

/// Receives the progress of an upload.
///
/// Snapshots are delivered for every progress event; consumers which
/// render them should do their own throttling.
pub trait ProgressObserver {
    fn on_progress(&mut self, _snapshot: &ProgressSnapshot) {}

    fn on_phase(&mut self, _phase: &UploadPhase) {}
}

impl ProgressObserver for () {}

impl<O: ProgressObserver + ?Sized> ProgressObserver for &mut O {
    fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        (**self).on_progress(snapshot)
    }

    fn on_phase(&mut self, phase: &UploadPhase) {
        (**self).on_phase(phase)
    }
}

impl ProgressObserver for mpsc::UnboundedSender<ProgressSnapshot> {
    fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        // A dropped receiver only means nobody is listening.
        let _ = self.send(*snapshot);
    }
}

impl ProgressObserver for watch::Sender<ProgressSnapshot> {
    fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        self.send_replace(*snapshot);
    }
}

/// Folds per-part progress into [ProgressSnapshot]s.
///
/// Keeps the cumulative bytes of every part, so `loaded` is exact no matter
/// how the events of different parts interleave.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    parts: Vec<u64>,
    loaded: u64,
    speed: f64,
    previous_loaded: u64,
    previous_time: Instant,
}

impl ProgressTracker {
    pub fn new(total: u64, part_count: usize) -> Self {
        Self::starting_at(total, part_count, Instant::now())
    }

    pub fn starting_at(total: u64, part_count: usize, now: Instant) -> Self {
        ProgressTracker {
            total,
            parts: vec![0; part_count],
            loaded: 0,
            speed: 0.0,
            previous_loaded: 0,
            previous_time: now,
        }
    }

    pub fn record(&mut self, index: usize, progress: PartProgress) -> ProgressSnapshot {
        self.record_at(index, progress, Instant::now())
    }

    /// Set the cumulative bytes of the part at `index` as of `now`.
    pub fn record_at(
        &mut self,
        index: usize,
        progress: PartProgress,
        now: Instant,
    ) -> ProgressSnapshot {
        if let Some(part) = self.parts.get_mut(index) {
            let bytes_loaded = progress.bytes_loaded.min(progress.bytes_total);
            self.loaded = self.loaded - *part + bytes_loaded;
            *part = bytes_loaded;
        }

        let elapsed = now.saturating_duration_since(self.previous_time).as_secs_f64();
        // Events which share an instant are folded into the next measurement.
        if elapsed > 0.0 {
            self.speed = (self.loaded as f64 - self.previous_loaded as f64) / elapsed;
            self.previous_loaded = self.loaded;
            self.previous_time = now;
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            loaded: self.loaded,
            position: if self.total == 0 {
                0.0
            } else {
                self.loaded as f64 / self.total as f64
            },
            total: self.total,
            speed: self.speed,
        }
    }
}
