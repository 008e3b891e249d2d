//! Embedded virtual-machine contracts.
//!
//! Movie-object (menu) titles are driven by a command VM; application
//! titles by an application host. Both live behind traits; the player owns
//! the orchestration loop and reacts to the events they emit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm execution failed: {0}")]
    Execution(String),
    #[error("object {0} not found")]
    ObjectNotFound(u32),
}

/// One navigation command (opcode word + two operands).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavCommand(pub [u32; 3]);

// ============================================================================
// Menu VM
// ============================================================================

/// Playback requests emitted by the menu VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuVmEvent {
    None,
    /// Object finished without a pending playback request.
    End,
    /// Jump to a title (0 = top menu, 0xffff = first play).
    Title(u32),
    PlayPlaylist(u32),
    PlayItem(u32),
    PlayMark(u32),
    PlayStop,
    /// Resume the playlist suspended by a menu call; saved player state is
    /// restored before playback continues.
    Resume,
    /// Still frame; param 0xffff = infinite.
    Still(u32),
    EnableButton(u32),
    DisableButton(u32),
    SetButtonPage(u32),
    PopupOff,
    IgEnd,
}

/// Movie-object command interpreter.
pub trait MenuVm: Send {
    /// Execute until the object suspends, finishes or emits an event.
    fn run(&mut self) -> Result<(), VmError>;

    /// Drain the next pending VM event.
    fn next_event(&mut self) -> MenuVmEvent;

    /// Select the movie object backing a title.
    fn select_object(&mut self, id_ref: u32) -> Result<(), VmError>;

    /// Execute button navigation commands (from the graphics controller).
    fn set_object(&mut self, commands: &[NavCommand]) -> Result<(), VmError>;

    /// Suspend the current playlist for a menu call.
    fn suspend_playlist(&mut self);

    fn resume(&mut self);

    /// Break a still frame.
    fn skip_still(&mut self) -> bool;

    /// True while an object is executing (not suspended, not finished).
    fn running(&self) -> bool;
}

// ============================================================================
// Application Host
// ============================================================================

/// Lifecycle and player-state events forwarded to an application title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Start(u32),
    Stop,
    /// PSR102 handshake value changed.
    Psr102(u32),
    EndOfPlaylist(u32),
    Playlist(u32),
    PlayItem(u32),
    Chapter(u32),
    Mark(u32),
    Pts(u64),
    VkKey(u32),
    Mouse(u16, u16),
    /// A user operation was blocked by the active UO mask.
    UoMasked(u32),
    Angle(u32),
    AudioStream(u32),
    Subtitle(u32),
    SecondaryStream(u32),
    Rate(u32),
}

/// Host for application (BD-J style) titles.
pub trait AppHost: Send {
    /// Start the application backing a title. Returns false when the
    /// application cannot be launched.
    fn start(&mut self, title: u32) -> bool;

    fn stop(&mut self);

    fn send_event(&mut self, event: AppEvent);

    /// True while the application is still initializing; the player reports
    /// idle instead of reading.
    fn waiting_start(&self) -> bool;
}

// ============================================================================
// Title Type
// ============================================================================

/// What kind of object drives the currently selected title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleType {
    /// Playlist opened directly, no VM in control.
    None,
    /// Movie-object title; param is the title number.
    Menu(u32),
    /// Application title; param is the title number.
    App(u32),
}

impl TitleType {
    pub fn is_menu(&self) -> bool {
        matches!(self, TitleType::Menu(_))
    }

    pub fn is_app(&self) -> bool {
        matches!(self, TitleType::App(_))
    }
}
