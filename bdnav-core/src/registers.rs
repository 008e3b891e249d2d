//! Player Status Registers (PSR bank).
//!
//! A fixed bank of numbered 32-bit registers holding player and title state
//! (selected streams, angle, title, chapter, playback time, capabilities).
//! Register writes produce ordered notifications which the player drains
//! synchronously; compound read-modify-write sequences are bracketed by an
//! explicit bank lock so no notification observes a half-updated selection.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use tracing::debug;

// ============================================================================
// Register numbers
// ============================================================================

pub const PSR_IG_STREAM_ID: u32 = 0;
pub const PSR_PRIMARY_AUDIO_ID: u32 = 1;
pub const PSR_PG_STREAM: u32 = 2;
pub const PSR_ANGLE_NUMBER: u32 = 3;
pub const PSR_TITLE_NUMBER: u32 = 4;
pub const PSR_CHAPTER: u32 = 5;
pub const PSR_PLAYLIST: u32 = 6;
pub const PSR_PLAYITEM: u32 = 7;
pub const PSR_TIME: u32 = 8;
pub const PSR_NAV_TIMER: u32 = 9;
pub const PSR_SELECTED_BUTTON_ID: u32 = 10;
pub const PSR_MENU_PAGE_ID: u32 = 11;
pub const PSR_STILL_TIME: u32 = 12;
pub const PSR_PARENTAL: u32 = 13;
pub const PSR_SECONDARY_AUDIO_VIDEO: u32 = 14;
pub const PSR_AUDIO_CAP: u32 = 15;
pub const PSR_AUDIO_LANG: u32 = 16;
pub const PSR_PG_AND_SUB_LANG: u32 = 17;
pub const PSR_MENU_LANG: u32 = 18;
pub const PSR_COUNTRY: u32 = 19;
pub const PSR_REGION: u32 = 20;
pub const PSR_OUTPUT_PREFER: u32 = 21;
pub const PSR_3D_STATUS: u32 = 22;
pub const PSR_DISPLAY_CAP: u32 = 23;
pub const PSR_3D_CAP: u32 = 24;
pub const PSR_VIDEO_CAP: u32 = 29;
pub const PSR_TEXT_CAP: u32 = 30;
pub const PSR_PROFILE_VERSION: u32 = 31;

/// Sentinel for "no chapter selected yet".
pub const CHAPTER_NONE: u32 = 0xffff;

const NUM_PSR: usize = 128;

/// Registers stored/restored around suspend-resume, and their backup slots.
const SAVED_PSRS: [u32; 8] = [
    PSR_TITLE_NUMBER,
    PSR_CHAPTER,
    PSR_PLAYLIST,
    PSR_PLAYITEM,
    PSR_TIME,
    PSR_SELECTED_BUTTON_ID,
    PSR_MENU_PAGE_ID,
    PSR_STILL_TIME,
];
const BACKUP_BASE: u32 = 36;

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsrEventKind {
    /// Register written (value unchanged).
    Write,
    /// Register written with a new value.
    Change,
    /// Register restored from saved player state.
    Restore,
    /// Player state saved.
    Save,
}

#[derive(Debug, Clone, Copy)]
pub struct PsrEvent {
    pub kind: PsrEventKind,
    pub psr: u32,
    pub old: u32,
    pub new: u32,
}

// ============================================================================
// Register bank
// ============================================================================

struct BankInner {
    psr: [u32; NUM_PSR],
    pending: VecDeque<PsrEvent>,
}

impl BankInner {
    fn notify(&mut self, kind: PsrEventKind, psr: u32, old: u32, new: u32) {
        self.pending.push_back(PsrEvent {
            kind,
            psr,
            old,
            new,
        });
    }

    fn write(&mut self, psr: u32, val: u32) {
        let idx = psr as usize;
        if idx >= NUM_PSR {
            debug!(psr, "write to invalid register ignored");
            return;
        }
        let old = self.psr[idx];
        self.psr[idx] = val;
        if old == val {
            self.notify(PsrEventKind::Write, psr, old, val);
        } else {
            self.notify(PsrEventKind::Change, psr, old, val);
        }
    }
}

/// The register bank. Shared between the player session and its embedded
/// collaborators (menu VM, graphics controller).
pub struct PsrBank {
    inner: Mutex<BankInner>,
}

impl Default for PsrBank {
    fn default() -> Self {
        Self::new()
    }
}

impl PsrBank {
    pub fn new() -> Self {
        let mut psr = [0u32; NUM_PSR];
        // Player defaults.
        psr[PSR_IG_STREAM_ID as usize] = 1;
        psr[PSR_PRIMARY_AUDIO_ID as usize] = 0xff;
        psr[PSR_PG_STREAM as usize] = 0x0fff_0fff;
        psr[PSR_ANGLE_NUMBER as usize] = 1;
        psr[PSR_TITLE_NUMBER as usize] = 0xffff;
        psr[PSR_CHAPTER as usize] = CHAPTER_NONE;
        psr[PSR_SELECTED_BUTTON_ID as usize] = 0xffff;
        psr[PSR_PARENTAL as usize] = 0xff;
        psr[PSR_AUDIO_LANG as usize] = 0xff_ffff;
        psr[PSR_PG_AND_SUB_LANG as usize] = 0xff_ffff;
        psr[PSR_MENU_LANG as usize] = 0xff_ffff;
        psr[PSR_COUNTRY as usize] = 0xffff;
        psr[PSR_REGION as usize] = 2;

        Self {
            inner: Mutex::new(BankInner {
                psr,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn read(&self, psr: u32) -> u32 {
        let inner = self.inner.lock();
        *inner.psr.get(psr as usize).unwrap_or(&0)
    }

    /// Write a register, producing a WRITE or CHANGE notification.
    pub fn write(&self, psr: u32, val: u32) {
        self.inner.lock().write(psr, val);
    }

    /// Write only the bits selected by `mask`.
    pub fn write_bits(&self, psr: u32, val: u32, mask: u32) {
        let mut inner = self.inner.lock();
        let old = *inner.psr.get(psr as usize).unwrap_or(&0);
        inner.write(psr, (old & !mask) | (val & mask));
    }

    /// Write a player-setting register. No notification when unchanged.
    pub fn setting_write(&self, psr: u32, val: u32) {
        let mut inner = self.inner.lock();
        if inner.psr.get(psr as usize) == Some(&val) {
            return;
        }
        inner.write(psr, val);
    }

    /// Save the playback-position registers to their backup slots.
    pub fn save_state(&self) {
        let mut inner = self.inner.lock();
        for (i, &psr) in SAVED_PSRS.iter().enumerate() {
            inner.psr[(BACKUP_BASE as usize) + i] = inner.psr[psr as usize];
        }
        inner.notify(PsrEventKind::Save, 0, 0, 0);
    }

    /// Restore the playback-position registers, producing one RESTORE
    /// notification per register.
    pub fn restore_state(&self) {
        let mut inner = self.inner.lock();
        for (i, &psr) in SAVED_PSRS.iter().enumerate() {
            let old = inner.psr[psr as usize];
            let new = inner.psr[(BACKUP_BASE as usize) + i];
            inner.psr[psr as usize] = new;
            inner.notify(PsrEventKind::Restore, psr, old, new);
        }
    }

    /// Acquire the bank lock for a compound read-modify-decide-write
    /// sequence. Notifications produced under the guard are delivered in
    /// order once drained.
    pub fn lock(&self) -> PsrGuard<'_> {
        PsrGuard {
            inner: self.inner.lock(),
        }
    }

    /// Drain the next pending notification, in write order.
    pub fn take_event(&self) -> Option<PsrEvent> {
        self.inner.lock().pending.pop_front()
    }
}

/// Guard for compound multi-register updates.
pub struct PsrGuard<'a> {
    inner: MutexGuard<'a, BankInner>,
}

impl PsrGuard<'_> {
    pub fn read(&self, psr: u32) -> u32 {
        *self.inner.psr.get(psr as usize).unwrap_or(&0)
    }

    pub fn write(&mut self, psr: u32, val: u32) {
        self.inner.write(psr, val);
    }
}
