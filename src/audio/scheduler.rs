//! Gapless playback scheduling
//! Chains decoded response buffers back-to-back on the output clock, in arrival order

use std::collections::BTreeMap;

/// Identifier of one scheduled playback buffer
pub type SourceId = u64;

/// A buffer placed on the output timeline
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    /// Output-clock time (seconds) at which playback begins
    pub start_at: f64,
    /// Length in seconds
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Owns the playback cursor and the set of sources still sounding
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    active: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the cursor at a given output time instead of zero
    pub fn starting_at(time: f64) -> Self {
        Self {
            next_start_time: time,
            ..Self::default()
        }
    }

    /// Current cursor value
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Place a buffer of `duration` seconds right after everything already queued,
    /// but never before `now`
    pub fn schedule(&mut self, duration: f64, now: f64) -> ScheduledSource {
        self.next_start_time = self.next_start_time.max(now);

        let source = ScheduledSource {
            id: self.next_id,
            start_at: self.next_start_time,
            duration: duration.max(0.0),
        };
        self.next_id += 1;

        self.next_start_time += source.duration;
        self.active.insert(source.id, source);
        source
    }

    /// Forget a source whose playback completed. Returns false for unknown ids.
    pub fn finish(&mut self, id: SourceId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Remove every active source, returning their ids in schedule order
    pub fn drain(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut self.active).into_keys().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_sources(&self) -> impl Iterator<Item = &ScheduledSource> {
        self.active.values()
    }
}
