//! Navigation event queue.
//!
//! Internal state transitions (register writes, menu VM commands, read
//! errors, graphics controller status changes) are decoupled from the
//! consumer's pull-based read loop through a bounded FIFO of navigation
//! events. The consumer drains at most one event per read/poll call.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Maximum number of queued events. Producers never block; when the queue
/// is full the new event is dropped with a diagnostic.
const EVENT_QUEUE_CAP: usize = 100;

// ============================================================================
// Event Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    None,
    /// Fatal error; param is an [`ErrorCode`].
    Error,
    /// Recoverable read error (broken aligned unit, short read).
    ReadError,
    /// Stream appears to be encrypted and cannot be played.
    Encrypted,

    /* current playback position */
    Angle,
    Title,
    Playlist,
    PlayItem,
    Chapter,
    PlayMark,
    EndOfTitle,

    /* stream selection */
    AudioStream,
    IgStream,
    PgTextstStream,
    PipPgTextstStream,
    SecondaryAudioStream,
    SecondaryVideoStream,
    SecondaryVideoSize,
    PgTextst,
    PipPgTextst,
    SecondaryAudio,
    SecondaryVideo,

    /* playback control */
    PlaylistStop,
    Discontinuity,
    Seek,
    Still,
    StillTime,
    SoundEffect,
    Idle,
    Popup,
    Menu,
    StereoscopicStatus,
    KeyInterestTable,
    UoMaskChanged,
}

/// Parameter values for [`EventKind::Error`] / [`EventKind::Encrypted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    Hdmv = 1,
    Bdj = 2,
    Aacs = 3,
    Bdplus = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub param: u32,
}

impl Event {
    pub const NONE: Event = Event {
        kind: EventKind::None,
        param: 0,
    };

    pub fn new(kind: EventKind, param: u32) -> Self {
        Self { kind, param }
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::NONE
    }
}

// ============================================================================
// Event Queue
// ============================================================================

/// Bounded FIFO of navigation events.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(EVENT_QUEUE_CAP),
        }
    }

    /// Enqueue an event. Returns false (and drops the event) on overflow.
    pub fn push(&mut self, kind: EventKind, param: u32) -> bool {
        if self.queue.len() >= EVENT_QUEUE_CAP {
            warn!(?kind, param, "event queue overflow, dropping event");
            return false;
        }
        self.queue.push_back(Event::new(kind, param));
        true
    }

    /// Dequeue the oldest pending event, if any.
    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
