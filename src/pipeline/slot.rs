//! Single-slot, latest-value frame buffer shared by the reader and the driver

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use tokio::time::Instant;

use crate::Frame;

/// Holds the most recent frame. Writes replace, reads never block and never
/// observe a half-written frame: the whole entry is swapped as one `Arc`.
pub struct FrameSlot {
    current: ArcSwapOption<SlotEntry>,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct SlotEntry {
    frame: Arc<Frame>,
    updated_at: Instant,
    /// Set by the first reader that sees this entry
    seen: AtomicBool,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_overwritten: AtomicU64,
}

/// What a reader gets back from the slot
#[derive(Debug, Clone)]
pub struct SlotRead {
    pub frame: Arc<Frame>,
    pub age: Duration,
}

/// Snapshot of the slot counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub written: u64,
    pub read: u64,
    /// Frames replaced before any reader saw them
    pub overwritten: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Replace the held frame, stamping it with the current time
    pub fn put(&self, frame: Frame) {
        self.put_at(frame, Instant::now());
    }

    pub fn put_at(&self, frame: Frame, updated_at: Instant) {
        let entry = Arc::new(SlotEntry {
            frame: Arc::new(frame),
            updated_at,
            seen: AtomicBool::new(false),
        });

        // Previous entry is dropped here unless a reader still holds it
        if let Some(previous) = self.current.swap(Some(entry)) {
            if !previous.seen.load(Ordering::Relaxed) {
                self.stats.frames_overwritten.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Current frame and its age, or `None` before the first frame
    pub fn get(&self) -> Option<SlotRead> {
        self.get_at(Instant::now())
    }

    pub fn get_at(&self, now: Instant) -> Option<SlotRead> {
        let entry = self.current.load_full()?;
        entry.seen.store(true, Ordering::Relaxed);
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);

        Some(SlotRead {
            frame: Arc::clone(&entry.frame),
            age: now.saturating_duration_since(entry.updated_at),
        })
    }

    /// Time the held frame was last replaced
    pub fn last_updated(&self) -> Option<Instant> {
        self.current.load().as_ref().map(|entry| entry.updated_at)
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_none()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            overwritten: self.stats.frames_overwritten.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
