//! Graphics controller contract.
//!
//! The interactive-graphics / presentation-graphics compositor lives behind
//! this trait. The player drives it with control commands and feeds it
//! demultiplexed units; results carry menu status, navigation commands
//! fired by button activation, page UO masks and text-subtitle timing.

use crate::uo_mask::UoMask;
use crate::vm::NavCommand;

// ============================================================================
// Controls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcControl {
    /// (Re)build the menu for the current title.
    InitMenu,
    /// Virtual key event; param carries the key code and press flags.
    VkKey,
    MouseMove,
    EnableButton,
    DisableButton,
    SetButtonPage,
    /// Toggle popup menu.
    Popup,
    /// Interactive composition ended.
    IgEnd,
    /// Advance presentation-graphics / text-subtitle state to a pts.
    PgUpdate,
    Reset,
    /// Idle tick for button animation.
    Nop,
}

/// Status bits reported back by the controller.
pub const GC_STATUS_MENU_OPEN: u32 = 1;
pub const GC_STATUS_POPUP: u32 = 2;
pub const GC_STATUS_ANIMATE: u32 = 4;

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GcResult {
    pub status: u32,
    /// UO mask of the active menu page.
    pub page_uo_mask: UoMask,
    /// Click/activation sound to play.
    pub sound_id: Option<u32>,
    /// Next text-subtitle event time, 45 kHz ticks.
    pub wakeup_time: Option<u64>,
    /// Navigation commands fired by button activation, to be executed by
    /// the menu VM.
    pub nav_commands: Option<Vec<NavCommand>>,
}

/// Graphics controller driven by the player. `run` returns `None` when the
/// command does not apply (no composition decoded yet).
pub trait GraphicsController: Send {
    fn run(&mut self, ctrl: GcControl, param: u64) -> Option<GcResult>;

    /// Feed demultiplexed 192-byte source packets for a graphics PID.
    /// Returns false when the data was not consumed.
    fn decode_ts(&mut self, pid: u16, units: &[u8]) -> bool;
}
