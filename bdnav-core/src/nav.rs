//! Navigation model.
//!
//! Already-parsed playlist structures (clip sequence, play marks, chapters,
//! sub-paths) plus the search arithmetic over them. Parsing the on-disc
//! binary tables is out of scope; a [`Navigator`] implementation supplies
//! titles as ready-made [`NavTitle`] values.
//!
//! Positions use two coordinate systems:
//! - title packets: cumulative 192-byte source packets from title start
//! - ticks: 45 kHz clock, as used by playlist in/out times

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::uo_mask::UoMask;

/// 45 kHz ticks per second.
pub const TICKS_PER_SEC: u64 = 45_000;

#[derive(Debug, Error)]
pub enum NavError {
    #[error("title {0:?} not found")]
    TitleNotFound(String),
    #[error("invalid angle {0}")]
    InvalidAngle(u8),
    #[error("malformed title {0:?}: {1}")]
    Malformed(String, String),
}

// ============================================================================
// Stream composition
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub pid: u16,
    pub coding_type: u8,
    /// ISO 639-2 language code, zeroed when not applicable.
    pub lang: [u8; 3],
}

impl StreamEntry {
    pub fn new(pid: u16, coding_type: u8, lang: &[u8; 3]) -> Self {
        Self {
            pid,
            coding_type,
            lang: *lang,
        }
    }
}

/// Streams declared by the clip for one play item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamTable {
    pub video: Vec<StreamEntry>,
    pub audio: Vec<StreamEntry>,
    pub pg: Vec<StreamEntry>,
    pub ig: Vec<StreamEntry>,
    pub secondary_audio: Vec<StreamEntry>,
    pub secondary_video: Vec<StreamEntry>,
}

// ============================================================================
// Clips, marks, sub-paths
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipConnection {
    /// Seamless connection; playback continues without discontinuity.
    Seamless,
    /// Clean break; downstream decoders must be flushed.
    NonSeamless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StillMode {
    None,
    /// Still for `still_time` seconds.
    Time,
    /// Still until user interaction.
    Infinite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipInfo {
    /// Base clip id, also the stream file stem for angle 1.
    pub name: String,
    /// Stream file stems for angles 2..; empty for single-angle items.
    pub angle_names: Vec<String>,
    /// First/last source packet of the played interval, clip-relative.
    pub start_pkt: u32,
    pub end_pkt: u32,
    /// Cumulative title packet at which this clip begins.
    pub title_pkt: u32,
    /// Presentation interval, 45 kHz ticks.
    pub in_time: u64,
    pub out_time: u64,
    /// Cumulative title time at which this clip begins.
    pub title_time: u64,
    pub connection: ClipConnection,
    pub still_mode: StillMode,
    pub still_time: u16,
    pub streams: StreamTable,
    pub uo_mask: UoMask,
}

impl ClipInfo {
    pub fn packets(&self) -> u32 {
        self.end_pkt - self.start_pkt
    }

    pub fn duration(&self) -> u64 {
        self.out_time - self.in_time
    }

    /// Stream file stem for the given 1-based angle.
    pub fn name_for_angle(&self, angle: u8) -> &str {
        match angle {
            0 | 1 => &self.name,
            n => self
                .angle_names
                .get(n as usize - 2)
                .map(String::as_str)
                .unwrap_or(&self.name),
        }
    }

    pub fn angle_count(&self) -> u8 {
        1 + self.angle_names.len() as u8
    }

    /// Clip-relative packet for a tick inside this clip's interval,
    /// interpolated linearly over the played range.
    fn packet_at_tick(&self, tick: u64) -> u32 {
        if self.duration() == 0 {
            return self.start_pkt;
        }
        let off = tick.saturating_sub(self.in_time).min(self.duration());
        self.start_pkt + (off * u64::from(self.packets()) / self.duration()) as u32
    }

    fn tick_at_packet(&self, clip_pkt: u32) -> u64 {
        if self.packets() == 0 {
            return self.in_time;
        }
        let off = clip_pkt.saturating_sub(self.start_pkt).min(self.packets());
        self.in_time + u64::from(off) * self.duration() / u64::from(self.packets())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkKind {
    /// Chapter entry mark.
    Entry,
    Link,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlayMark {
    pub kind: MarkKind,
    pub clip_index: usize,
    /// Clip-relative packet of the mark point.
    pub clip_pkt: u32,
    pub title_pkt: u32,
    pub tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubPathKind {
    InteractiveGraphics,
    TextSubtitle,
}

/// Out-of-mux presentation path (preloaded in full before playback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPath {
    pub kind: SubPathKind,
    pub clip: ClipInfo,
}

// ============================================================================
// Title
// ============================================================================

/// Position resolved by a search operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub clip_index: usize,
    /// Clip-relative packet, not yet unit-aligned.
    pub clip_pkt: u32,
    pub title_pkt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavTitle {
    /// Playlist name, e.g. "00001.mpls".
    pub name: String,
    /// Current 1-based angle.
    pub angle: u8,
    pub angle_count: u8,
    pub clips: Vec<ClipInfo>,
    /// Chapter entry marks, in title order.
    pub chapters: Vec<PlayMark>,
    /// All play marks (chapters included), in title order.
    pub marks: Vec<PlayMark>,
    pub sub_paths: Vec<SubPath>,
    /// Playlist-level user-operation mask.
    pub uo_mask: UoMask,
    /// Total title packets across all clips.
    pub packets: u32,
}

impl NavTitle {
    pub fn duration(&self) -> u64 {
        self.clips
            .last()
            .map(|c| c.title_time + c.duration())
            .unwrap_or(0)
    }

    fn clip_at_packet(&self, title_pkt: u32) -> usize {
        // partition_point: first clip starting after the target, minus one
        self.clips
            .partition_point(|c| c.title_pkt <= title_pkt)
            .saturating_sub(1)
    }

    /// Resolve an absolute title packet to a clip position. Positions past
    /// the end clamp to the last played packet.
    pub fn packet_search(&self, title_pkt: u32) -> Option<SearchResult> {
        if self.clips.is_empty() {
            return None;
        }
        let pkt = title_pkt.min(self.packets.saturating_sub(1));
        let clip_index = self.clip_at_packet(pkt);
        let clip = &self.clips[clip_index];
        let clip_pkt = clip.start_pkt + (pkt - clip.title_pkt).min(clip.packets());
        Some(SearchResult {
            clip_index,
            clip_pkt,
            title_pkt: pkt,
        })
    }

    /// Resolve a 45 kHz tick to a clip position. Ticks at or past the title
    /// duration are rejected.
    pub fn time_search(&self, tick: u64) -> Option<SearchResult> {
        if self.clips.is_empty() || tick >= self.duration() {
            return None;
        }
        let clip_index = self
            .clips
            .partition_point(|c| c.title_time <= tick)
            .saturating_sub(1);
        let clip = &self.clips[clip_index];
        let clip_pkt = clip.packet_at_tick(clip.in_time + (tick - clip.title_time));
        Some(SearchResult {
            clip_index,
            clip_pkt,
            title_pkt: clip.title_pkt + (clip_pkt - clip.start_pkt),
        })
    }

    pub fn chapter_search(&self, chapter: usize) -> Option<SearchResult> {
        self.mark_position(self.chapters.get(chapter)?)
    }

    pub fn mark_search(&self, mark: usize) -> Option<SearchResult> {
        self.mark_position(self.marks.get(mark)?)
    }

    fn mark_position(&self, mark: &PlayMark) -> Option<SearchResult> {
        if mark.clip_index >= self.clips.len() {
            return None;
        }
        Some(SearchResult {
            clip_index: mark.clip_index,
            clip_pkt: mark.clip_pkt,
            title_pkt: mark.title_pkt,
        })
    }

    /// 0-based chapter containing the given title packet.
    pub fn chapter_at(&self, title_pkt: u32) -> u32 {
        self.chapters
            .partition_point(|m| m.title_pkt <= title_pkt)
            .saturating_sub(1) as u32
    }

    /// Index of the first mark strictly after the given title packet.
    pub fn next_mark(&self, title_pkt: u32) -> Option<usize> {
        let idx = self.marks.partition_point(|m| m.title_pkt <= title_pkt);
        (idx < self.marks.len()).then_some(idx)
    }

    pub fn next_clip(&self, current: usize) -> Option<usize> {
        let next = current + 1;
        (next < self.clips.len()).then_some(next)
    }

    /// Select an angle, clamped to the title's angle count. Returns true if
    /// the angle changed.
    pub fn set_angle(&mut self, angle: u8) -> bool {
        let angle = angle.clamp(1, self.angle_count.max(1));
        if angle == self.angle {
            return false;
        }
        self.angle = angle;
        true
    }

    /// Convert a clip position to a title-relative tick.
    pub fn packet_to_tick(&self, clip_index: usize, clip_pkt: u32) -> u64 {
        let Some(clip) = self.clips.get(clip_index) else {
            return 0;
        };
        clip.title_time + (clip.tick_at_packet(clip_pkt) - clip.in_time)
    }

    pub fn find_sub_path(&self, kind: SubPathKind) -> Option<&SubPath> {
        self.sub_paths.iter().find(|sp| sp.kind == kind)
    }
}

/// Supplies parsed titles by playlist name.
pub trait Navigator: Send {
    fn open_title(&mut self, name: &str, angle: u8) -> Result<NavTitle, NavError>;
}

/// Playlist file name for a numeric playlist id.
pub fn playlist_name(playlist: u32) -> String {
    format!("{playlist:05}.mpls")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(name: &str, packets: u32, title_pkt: u32, ticks: u64, title_time: u64) -> ClipInfo {
        ClipInfo {
            name: name.to_string(),
            angle_names: Vec::new(),
            start_pkt: 0,
            end_pkt: packets,
            title_pkt,
            in_time: 0,
            out_time: ticks,
            title_time,
            connection: ClipConnection::Seamless,
            still_mode: StillMode::None,
            still_time: 0,
            streams: StreamTable::default(),
            uo_mask: UoMask::default(),
        }
    }

    fn two_clip_title() -> NavTitle {
        let clips = vec![
            clip("00001", 1000, 0, 90_000, 0),
            clip("00002", 500, 1000, 45_000, 90_000),
        ];
        let chapters = vec![
            PlayMark {
                kind: MarkKind::Entry,
                clip_index: 0,
                clip_pkt: 0,
                title_pkt: 0,
                tick: 0,
            },
            PlayMark {
                kind: MarkKind::Entry,
                clip_index: 1,
                clip_pkt: 100,
                title_pkt: 1100,
                tick: 99_000,
            },
        ];
        NavTitle {
            name: "00001.mpls".to_string(),
            angle: 1,
            angle_count: 1,
            clips,
            marks: chapters.clone(),
            chapters,
            sub_paths: Vec::new(),
            uo_mask: UoMask::default(),
            packets: 1500,
        }
    }

    #[test]
    fn test_packet_search_crosses_clip_boundary() {
        let t = two_clip_title();
        let r = t.packet_search(999).unwrap();
        assert_eq!((r.clip_index, r.clip_pkt), (0, 999));
        let r = t.packet_search(1000).unwrap();
        assert_eq!((r.clip_index, r.clip_pkt), (1, 0));
        // past-the-end clamps into the last clip
        let r = t.packet_search(9999).unwrap();
        assert_eq!(r.clip_index, 1);
        assert_eq!(r.title_pkt, 1499);
    }

    #[test]
    fn test_time_search_rejects_at_or_past_duration() {
        let t = two_clip_title();
        assert_eq!(t.duration(), 135_000);
        assert!(t.time_search(135_000).is_none());
        assert!(t.time_search(200_000).is_none());

        let r = t.time_search(90_000).unwrap();
        assert_eq!((r.clip_index, r.clip_pkt), (1, 0));
        // one second in: 1000 pkt / 2 sec clip
        let r = t.time_search(45_000).unwrap();
        assert_eq!((r.clip_index, r.clip_pkt), (0, 500));
    }

    #[test]
    fn test_chapter_search_and_chapter_at() {
        let t = two_clip_title();
        let r = t.chapter_search(1).unwrap();
        assert_eq!((r.clip_index, r.clip_pkt, r.title_pkt), (1, 100, 1100));
        assert!(t.chapter_search(2).is_none());

        assert_eq!(t.chapter_at(0), 0);
        assert_eq!(t.chapter_at(1099), 0);
        assert_eq!(t.chapter_at(1100), 1);
    }

    #[test]
    fn test_next_mark_is_strictly_ahead() {
        let t = two_clip_title();
        assert_eq!(t.next_mark(0), Some(1));
        assert_eq!(t.next_mark(1099), Some(1));
        assert_eq!(t.next_mark(1100), None);
    }

    #[test]
    fn test_set_angle_clamps() {
        let mut t = two_clip_title();
        assert!(!t.set_angle(5)); // clamps to 1, unchanged
        t.angle_count = 3;
        assert!(t.set_angle(5));
        assert_eq!(t.angle, 3);
        assert!(!t.set_angle(3));
    }

    #[test]
    fn test_packet_to_tick_round_trips_clip_start() {
        let t = two_clip_title();
        assert_eq!(t.packet_to_tick(1, 0), 90_000);
        assert_eq!(t.packet_to_tick(0, 500), 45_000);
    }

    #[test]
    fn test_playlist_name_format() {
        assert_eq!(playlist_name(1), "00001.mpls");
        assert_eq!(playlist_name(12345), "12345.mpls");
    }

    #[test]
    fn test_name_for_angle() {
        let mut c = clip("00001", 10, 0, 0, 0);
        c.angle_names = vec!["00101".to_string()];
        assert_eq!(c.name_for_angle(1), "00001");
        assert_eq!(c.name_for_angle(2), "00101");
        assert_eq!(c.name_for_angle(3), "00001"); // out of range falls back
        assert_eq!(c.angle_count(), 2);
    }
}
