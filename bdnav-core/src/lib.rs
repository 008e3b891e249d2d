//! # bdnav Core
//!
//! Blu-ray playback-control engine: navigation, stream sessions, player
//! registers and the menu/application orchestration loop. Stream decoding
//! and rendering live downstream of this crate.

// ============================================================================
// Navigation Model
// ============================================================================
pub mod nav;
pub mod uo_mask;

// ============================================================================
// Disc & Stream Access
// ============================================================================
pub mod disc;
pub mod m2ts;

// ============================================================================
// Player State
// ============================================================================
pub mod events;
pub mod registers;

// ============================================================================
// Playback
// ============================================================================
pub mod gc;
pub mod player;
pub mod session;
pub mod vm;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
