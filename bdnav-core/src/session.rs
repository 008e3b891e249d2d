//! Stream session manager.
//!
//! Features:
//! - One main stream cursor over the current play item
//! - Transparent clip switching with discontinuity reporting
//! - Seeks by packet, time, chapter, mark and play item
//! - Play-mark tracking during sequential reads
//! - Seamless angle changes applied at clip boundaries
//! - Out-of-mux sub-path preloading (IG menus, text subtitles)
//! - Embedded graphics decode hooks and text-subtitle timing

use thiserror::Error;
use tracing::{debug, info};

use crate::disc::{ClipSource, DiscError};
use crate::events::{EventKind, EventQueue};
use crate::gc::{GcControl, GraphicsController};
use crate::m2ts::{self, Preload, StreamCursor, UnitRead, TS_PACKET};
use crate::nav::{ClipConnection, NavTitle, SearchResult, StillMode, StreamEntry, SubPathKind};
use crate::registers::{
    PsrBank, CHAPTER_NONE, PSR_ANGLE_NUMBER, PSR_AUDIO_LANG, PSR_CHAPTER, PSR_IG_STREAM_ID,
    PSR_PG_AND_SUB_LANG, PSR_PG_STREAM, PSR_PLAYITEM, PSR_PRIMARY_AUDIO_ID, PSR_TIME,
};

/// Stopping this close to the end of the last clip counts as ordinary
/// end-of-playback, not an interrupted playlist.
const STOP_AT_END_PKTS: u32 = 100;

/// Default cap on fully-buffered sub-path clips.
const PRELOAD_CAP_DEFAULT: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Disc(#[from] DiscError),
    #[error("stream cannot be played (encrypted)")]
    Encrypted,
    #[error("no stream open")]
    NoStream,
    #[error("seek target out of range")]
    SeekOutOfRange,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub preload_cap: u64,
    /// Null out transport packets not declared by the play item.
    pub filter_streams: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preload_cap: PRELOAD_CAP_DEFAULT,
            filter_streams: false,
        }
    }
}

/// Borrowed collaborators threaded through session operations.
pub struct SessionDeps<'a> {
    pub source: &'a dyn ClipSource,
    pub regs: &'a PsrBank,
    pub events: &'a mut EventQueue,
    pub gc: Option<&'a mut (dyn GraphicsController + 'static)>,
    pub config: &'a SessionConfig,
}

// ============================================================================
// Session
// ============================================================================

/// Playback state for one open playlist.
pub struct Session {
    pub title: NavTitle,
    st0: Option<StreamCursor>,
    preload_ig: Option<Preload>,
    preload_textst: Option<Preload>,

    /// Consumer byte position within the title.
    pub s_pos: u64,
    /// Next play mark ahead of the read position.
    next_mark: Option<usize>,
    /// Seamless angle change waiting for the next clip boundary.
    pending_angle: Option<u8>,

    /// End-of-playlist state: bit 0 = reached, bit 1 = app notified.
    end_of_playlist: u8,
    /// An interactive composition arrived in the main path; the player
    /// should rebuild menus.
    init_menu_pending: bool,

    /// Next text-subtitle event, title 45 kHz ticks.
    gc_wakeup_time: u64,
}

impl Session {
    /// Open a playlist: preload sub-paths and position the cursor at the
    /// first play item.
    pub fn open(title: NavTitle, deps: &mut SessionDeps<'_>) -> Result<Self, SessionError> {
        info!(playlist = %title.name, clips = title.clips.len(), "opening playlist");
        let mut session = Self {
            title,
            st0: None,
            preload_ig: None,
            preload_textst: None,
            s_pos: 0,
            next_mark: None,
            pending_angle: None,
            end_of_playlist: 0,
            init_menu_pending: false,
            gc_wakeup_time: u64::MAX,
        };
        if session.title.clips.is_empty() {
            return Err(SessionError::NoStream);
        }
        session.preload_sub_paths(deps);
        let start = session.title.clips[0].start_pkt;
        session.open_cursor(deps, 0, start)?;
        session.next_mark = session.title.next_mark(0);
        Ok(session)
    }

    pub fn playlist_name(&self) -> &str {
        &self.title.name
    }

    /// Title packet at the read position.
    pub fn title_pkt(&self) -> u32 {
        (self.s_pos / TS_PACKET as u64) as u32
    }

    pub fn end_of_playlist(&self) -> u8 {
        self.end_of_playlist
    }

    pub fn mark_app_end_sent(&mut self) {
        self.end_of_playlist |= 2;
    }

    pub fn take_init_menu_pending(&mut self) -> bool {
        std::mem::take(&mut self.init_menu_pending)
    }

    /// Combined UO mask: playlist level plus current clip level.
    pub fn uo_mask(&self) -> crate::uo_mask::UoMask {
        let clip_mask = self
            .st0
            .as_ref()
            .map(|st| st.uo_mask)
            .unwrap_or_default();
        self.title.uo_mask.union(clip_mask)
    }

    pub fn current_clip(&self) -> Option<usize> {
        self.st0.as_ref().map(|st| st.clip_index)
    }

    pub fn current_still_mode(&self) -> StillMode {
        self.st0
            .as_ref()
            .map(|st| self.title.clips[st.clip_index].still_mode)
            .unwrap_or(StillMode::None)
    }

    // ------------------------------------------------------------------------
    // Cursor / clip management
    // ------------------------------------------------------------------------

    fn preload_sub_paths(&mut self, deps: &mut SessionDeps<'_>) {
        for kind in [SubPathKind::InteractiveGraphics, SubPathKind::TextSubtitle] {
            let Some(sp) = self.title.find_sub_path(kind) else {
                continue;
            };
            let preload = m2ts::preload_clip(
                deps.source,
                &sp.clip,
                self.title.angle,
                deps.config.preload_cap,
                deps.events,
            );
            match kind {
                SubPathKind::InteractiveGraphics => self.preload_ig = preload,
                SubPathKind::TextSubtitle => self.preload_textst = preload,
            }
        }
    }

    /// Open (or reopen) the main cursor on a clip and update the play-item
    /// registers and stream selections.
    fn open_cursor(
        &mut self,
        deps: &mut SessionDeps<'_>,
        clip_index: usize,
        clip_pkt: u32,
    ) -> Result<(), SessionError> {
        let clip = &self.title.clips[clip_index];
        let mut st = StreamCursor::open(
            deps.source,
            clip_index,
            clip,
            self.title.angle,
            deps.config.filter_streams,
        )?;
        st.seek_to_packet(clip_pkt)?;
        self.st0 = Some(st);

        deps.regs.write(PSR_PLAYITEM, clip_index as u32);
        self.revalidate_stream_selection(deps, clip_index);
        self.init_ig_stream(deps);
        self.init_pg_stream(deps);
        self.init_textst_timer(deps);
        Ok(())
    }

    /// Keep the audio/PG stream registers inside the new clip's stream
    /// table, preferring the configured languages.
    fn revalidate_stream_selection(&self, deps: &mut SessionDeps<'_>, clip_index: usize) {
        let streams = &self.title.clips[clip_index].streams;
        let mut guard = deps.regs.lock();

        if !streams.audio.is_empty() {
            let cur = guard.read(PSR_PRIMARY_AUDIO_ID);
            if cur == 0xff || cur as usize > streams.audio.len() || cur == 0 {
                let lang = guard.read(PSR_AUDIO_LANG);
                let num = stream_by_lang(&streams.audio, lang);
                guard.write(PSR_PRIMARY_AUDIO_ID, num);
            }
        }
        if !streams.pg.is_empty() {
            let cur = guard.read(PSR_PG_STREAM);
            let num = cur & 0xfff;
            if num == 0 || num as usize > streams.pg.len() {
                let lang = guard.read(PSR_PG_AND_SUB_LANG);
                let sel = stream_by_lang(&streams.pg, lang);
                guard.write(PSR_PG_STREAM, (cur & !0xfff) | sel);
            }
        }
    }

    /// Resolve the interactive-graphics source: preloaded sub-path wins,
    /// otherwise the main-path IG stream selected by PSR0.
    pub fn init_ig_stream(&mut self, deps: &mut SessionDeps<'_>) {
        let Some(st) = self.st0.as_mut() else {
            return;
        };
        st.ig_pid = 0;

        if let Some(preload) = &self.preload_ig {
            if let Some(gc) = deps.gc.as_deref_mut() {
                if let Some(entry) = ig_entry(&preload.clip.streams.ig, deps.regs) {
                    if gc.decode_ts(entry.pid, &preload.buf) {
                        self.init_menu_pending = true;
                    }
                }
            }
            return;
        }

        let streams = &self.title.clips[st.clip_index].streams;
        if let Some(entry) = ig_entry(&streams.ig, deps.regs) {
            st.ig_pid = entry.pid;
        }
    }

    /// Select the in-mux PG stream PID from PSR2 (when display is enabled).
    pub fn init_pg_stream(&mut self, deps: &mut SessionDeps<'_>) {
        let Some(st) = self.st0.as_mut() else {
            return;
        };
        st.pg_pid = 0;
        if self.preload_textst.is_some() {
            return; // text subtitles come from the preloaded sub-path
        }
        let psr2 = deps.regs.read(PSR_PG_STREAM);
        if psr2 & 0x8000_0000 == 0 {
            return;
        }
        let num = (psr2 & 0xfff) as usize;
        let streams = &self.title.clips[st.clip_index].streams;
        if num >= 1 && num <= streams.pg.len() {
            st.pg_pid = streams.pg[num - 1].pid;
        }
    }

    // ------------------------------------------------------------------------
    // Text-subtitle timing
    // ------------------------------------------------------------------------

    fn init_textst_timer(&mut self, deps: &mut SessionDeps<'_>) {
        self.gc_wakeup_time = if self.preload_textst.is_some() {
            0 // force an update on the first read
        } else {
            u64::MAX
        };
        self.update_textst_timer(deps);
    }

    /// Advance text-subtitle rendering when playback crosses the next
    /// scheduled subtitle event.
    fn update_textst_timer(&mut self, deps: &mut SessionDeps<'_>) {
        if self.preload_textst.is_none() {
            return;
        }
        let Some(st) = self.st0.as_ref() else {
            return;
        };
        let pts = self.title.packet_to_tick(st.clip_index, st.spn());
        if pts < self.gc_wakeup_time {
            return;
        }
        if let Some(gc) = deps.gc.as_deref_mut() {
            let wakeup = gc
                .run(GcControl::PgUpdate, pts)
                .and_then(|r| r.wakeup_time);
            self.gc_wakeup_time = wakeup.unwrap_or(u64::MAX);
        } else {
            self.gc_wakeup_time = u64::MAX;
        }
    }

    // ------------------------------------------------------------------------
    // Seeking
    // ------------------------------------------------------------------------

    fn seek_internal(
        &mut self,
        deps: &mut SessionDeps<'_>,
        target: SearchResult,
    ) -> Result<u64, SessionError> {
        // an explicit seek supersedes a queued seamless angle change
        self.pending_angle = None;

        match self.st0.as_mut() {
            Some(st) if st.clip_index == target.clip_index => {
                st.seek_to_packet(target.clip_pkt)?;
            }
            _ => self.open_cursor(deps, target.clip_index, target.clip_pkt)?,
        }

        self.s_pos = u64::from(target.title_pkt) * TS_PACKET as u64;
        self.end_of_playlist = 0;
        self.next_mark = self.title.next_mark(target.title_pkt);

        let tick = self
            .title
            .packet_to_tick(target.clip_index, target.clip_pkt);
        deps.regs.write(PSR_TIME, tick as u32);
        deps.regs
            .write(PSR_CHAPTER, self.chapter_psr_value(target.title_pkt));

        deps.events.push(EventKind::Seek, target.title_pkt);
        self.init_textst_timer(deps);
        debug!(
            title_pkt = target.title_pkt,
            clip = target.clip_index,
            "seek"
        );
        Ok(self.s_pos)
    }

    fn chapter_psr_value(&self, title_pkt: u32) -> u32 {
        if self.title.chapters.is_empty() {
            CHAPTER_NONE
        } else {
            self.title.chapter_at(title_pkt) + 1
        }
    }

    pub fn seek_pkt(
        &mut self,
        deps: &mut SessionDeps<'_>,
        title_pkt: u32,
    ) -> Result<u64, SessionError> {
        let target = self
            .title
            .packet_search(title_pkt)
            .ok_or(SessionError::SeekOutOfRange)?;
        self.seek_internal(deps, target)
    }

    pub fn seek_time(
        &mut self,
        deps: &mut SessionDeps<'_>,
        tick: u64,
    ) -> Result<u64, SessionError> {
        let target = self
            .title
            .time_search(tick)
            .ok_or(SessionError::SeekOutOfRange)?;
        self.seek_internal(deps, target)
    }

    pub fn seek_chapter(
        &mut self,
        deps: &mut SessionDeps<'_>,
        chapter: usize,
    ) -> Result<u64, SessionError> {
        let target = self
            .title
            .chapter_search(chapter)
            .ok_or(SessionError::SeekOutOfRange)?;
        self.seek_internal(deps, target)
    }

    pub fn seek_mark(
        &mut self,
        deps: &mut SessionDeps<'_>,
        mark: usize,
    ) -> Result<u64, SessionError> {
        let target = self
            .title
            .mark_search(mark)
            .ok_or(SessionError::SeekOutOfRange)?;
        self.seek_internal(deps, target)
    }

    pub fn seek_playitem(
        &mut self,
        deps: &mut SessionDeps<'_>,
        item: usize,
    ) -> Result<u64, SessionError> {
        let clip = self
            .title
            .clips
            .get(item)
            .ok_or(SessionError::SeekOutOfRange)?;
        let target = SearchResult {
            clip_index: item,
            clip_pkt: clip.start_pkt,
            title_pkt: clip.title_pkt,
        };
        self.seek_internal(deps, target)
    }

    // ------------------------------------------------------------------------
    // Angles
    // ------------------------------------------------------------------------

    /// Immediate angle change: reopen the current clip's angle file at the
    /// same position. Returns the effective angle.
    pub fn select_angle(&mut self, deps: &mut SessionDeps<'_>, angle: u8) -> Result<u8, SessionError> {
        self.pending_angle = None;
        if !self.title.set_angle(angle) {
            return Ok(self.title.angle);
        }
        if let Some(st) = self.st0.as_ref() {
            let clip_index = st.clip_index;
            let clip_pkt = st.spn();
            self.open_cursor(deps, clip_index, clip_pkt)?;
        }
        Ok(self.title.angle)
    }

    /// Request an angle change at the next clip boundary.
    pub fn request_seamless_angle_change(&mut self, angle: u8) {
        if angle >= 1 && angle <= self.title.angle_count && angle != self.title.angle {
            self.pending_angle = Some(angle);
        }
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Sequential read. May return fewer bytes than requested (clip
    /// boundary, pending events) or zero (end of title, still frame,
    /// skipped unit); zero-byte end-of-title reads are idempotent.
    pub fn read(
        &mut self,
        deps: &mut SessionDeps<'_>,
        out: &mut [u8],
    ) -> Result<usize, SessionError> {
        if self.st0.is_none() {
            return Err(SessionError::NoStream);
        }
        let mut out_len = 0usize;

        while out_len < out.len() {
            let Some((clip_index, clip_pkt)) =
                self.st0.as_ref().map(|st| (st.clip_index, st.spn()))
            else {
                break;
            };
            let clip_end = self.title.clips[clip_index].end_pkt;

            if clip_pkt >= clip_end {
                // flush what we have; the switch happens on the next call
                if out_len > 0 {
                    break;
                }
                if !self.advance_clip(deps, clip_index)? {
                    return Ok(0);
                }
                continue;
            }

            let Some(st) = self.st0.as_mut() else {
                break;
            };
            if st.needs_refill() {
                match st.read_unit(deps.events) {
                    UnitRead::Unit => {
                        self.feed_graphics(deps);
                    }
                    UnitRead::Empty => break,
                    UnitRead::Fatal => {
                        self.st0 = None;
                        return Err(SessionError::Encrypted);
                    }
                }
                continue;
            }

            let clip = &self.title.clips[clip_index];
            let title_pkt = clip.title_pkt + (clip_pkt - clip.start_pkt);

            // fire a crossed play mark before copying further
            if let Some(idx) = self.next_mark {
                let mark = self.title.marks[idx];
                if title_pkt >= mark.title_pkt {
                    deps.events.push(EventKind::PlayMark, idx as u32);
                    deps.regs
                        .write(PSR_CHAPTER, self.chapter_psr_value(title_pkt));
                    deps.regs.write(
                        PSR_TIME,
                        self.title.packet_to_tick(clip_index, clip_pkt) as u32,
                    );
                    self.next_mark = self.title.next_mark(title_pkt);
                    continue;
                }
            }

            let Some(st) = self.st0.as_mut() else {
                break;
            };
            let mut size = (out.len() - out_len).min(st.unit().len());
            // clamp at clip end
            size = size.min((clip_end - clip_pkt) as usize * TS_PACKET);
            // clamp at the next mark so crossing is detected exactly
            if let Some(idx) = self.next_mark {
                let mark_pkt = self.title.marks[idx].title_pkt;
                if mark_pkt > title_pkt {
                    size = size.min((mark_pkt - title_pkt) as usize * TS_PACKET);
                }
            }
            if size == 0 {
                break;
            }

            st.consume(&mut out[out_len..], size);
            out_len += size;
            self.s_pos += size as u64;
            self.update_textst_timer(deps);
        }

        Ok(out_len)
    }

    /// Handle the end of the current clip: still frames hold position,
    /// otherwise switch to the next clip (applying any pending seamless
    /// angle change) or report end of title exactly once.
    fn advance_clip(
        &mut self,
        deps: &mut SessionDeps<'_>,
        clip_index: usize,
    ) -> Result<bool, SessionError> {
        let clip = &self.title.clips[clip_index];
        match clip.still_mode {
            StillMode::Time => {
                deps.events
                    .push(EventKind::StillTime, u32::from(clip.still_time));
                return Ok(false);
            }
            StillMode::Infinite => {
                deps.events.push(EventKind::StillTime, 0);
                return Ok(false);
            }
            StillMode::None => {}
        }

        let Some(next) = self.title.next_clip(clip_index) else {
            if self.end_of_playlist & 1 == 0 {
                info!(playlist = %self.title.name, "end of title");
                deps.events.push(EventKind::EndOfTitle, 0);
                self.end_of_playlist |= 1;
            }
            return Ok(false);
        };

        if let Some(angle) = self.pending_angle.take() {
            if self.title.set_angle(angle) {
                deps.regs.write(PSR_ANGLE_NUMBER, u32::from(angle));
            }
        }

        let next_clip = &self.title.clips[next];
        let (start_pkt, connection, in_time) =
            (next_clip.start_pkt, next_clip.connection, next_clip.in_time);
        self.open_cursor(deps, next, start_pkt)?;
        if connection == ClipConnection::NonSeamless {
            deps.events.push(EventKind::Discontinuity, in_time as u32);
        }
        Ok(true)
    }

    /// Skip a still frame: move to the next clip regardless of still mode.
    pub fn skip_still(&mut self, deps: &mut SessionDeps<'_>) -> Result<bool, SessionError> {
        let Some(clip_index) = self.current_clip() else {
            return Ok(false);
        };
        let clip = &self.title.clips[clip_index];
        if clip.still_mode == StillMode::None {
            return Ok(false);
        }
        let clip_pkt = self.st0.as_ref().map(|st| st.spn()).unwrap_or(0);
        if clip_pkt < clip.end_pkt {
            return Ok(false);
        }
        let Some(next) = self.title.next_clip(clip_index) else {
            return Ok(false);
        };
        let start = self.title.clips[next].start_pkt;
        self.open_cursor(deps, next, start)?;
        Ok(true)
    }

    /// Feed the freshly-read unit to the graphics controller for the
    /// selected IG/PG PIDs.
    fn feed_graphics(&mut self, deps: &mut SessionDeps<'_>) {
        let Some(st) = self.st0.as_ref() else {
            return;
        };
        let (ig_pid, pg_pid) = (st.ig_pid, st.pg_pid);
        if ig_pid == 0 && pg_pid == 0 {
            return;
        }
        let Some(gc) = deps.gc.as_deref_mut() else {
            return;
        };
        let unit = st.unit();
        let mut init_menu = false;
        if ig_pid > 0 && gc.decode_ts(ig_pid, unit) {
            init_menu = true;
        }
        if pg_pid > 0 {
            gc.decode_ts(pg_pid, unit);
        }
        if init_menu {
            self.init_menu_pending = true;
        }
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Close the playlist. Reports PLAYLIST_STOP unless playback already
    /// reached (or nearly reached) the end of the last clip.
    pub fn close(mut self, deps: &mut SessionDeps<'_>) {
        let expected_stop = match self.st0.as_ref() {
            None => true,
            Some(st) => {
                let last = self.title.clips.len() - 1;
                let end = self.title.clips[last].end_pkt;
                st.clip_index == last && st.spn() + STOP_AT_END_PKTS >= end
            }
        };
        if !expected_stop {
            deps.events.push(EventKind::PlaylistStop, 0);
        }
        if let Some(gc) = deps.gc.as_deref_mut() {
            gc.run(GcControl::Reset, 0);
        }
        self.st0 = None;
        debug!(playlist = %self.title.name, expected_stop, "playlist closed");
    }
}

/// 1-based stream number whose language matches the preference register,
/// falling back to the first stream.
fn stream_by_lang(streams: &[StreamEntry], lang_psr: u32) -> u32 {
    let pref = [
        (lang_psr >> 16) as u8,
        (lang_psr >> 8) as u8,
        lang_psr as u8,
    ];
    streams
        .iter()
        .position(|s| s.lang == pref)
        .map(|i| i as u32 + 1)
        .unwrap_or(1)
}

/// IG stream entry selected by PSR0, when in range.
fn ig_entry<'a>(streams: &'a [StreamEntry], regs: &PsrBank) -> Option<&'a StreamEntry> {
    let num = regs.read(PSR_IG_STREAM_ID) as usize;
    (num >= 1 && num <= streams.len()).then(|| &streams[num - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::MemSource;
    use crate::events::Event;
    use crate::m2ts::{ALIGNED_UNIT, PKTS_PER_UNIT};
    use crate::nav::{ClipInfo, MarkKind, PlayMark, StreamTable};
    use crate::registers::PsrEventKind;
    use crate::uo_mask::UoMask;

    fn mk_unit(pid: u16) -> Vec<u8> {
        let mut unit = Vec::with_capacity(ALIGNED_UNIT);
        for _ in 0..PKTS_PER_UNIT {
            let mut p = [0u8; TS_PACKET];
            p[4] = 0x47;
            p[5] = (pid >> 8) as u8 & 0x1f;
            p[6] = pid as u8;
            unit.extend_from_slice(&p);
        }
        unit
    }

    fn clip(
        name: &str,
        packets: u32,
        title_pkt: u32,
        title_time: u64,
        connection: ClipConnection,
    ) -> ClipInfo {
        ClipInfo {
            name: name.to_string(),
            angle_names: Vec::new(),
            start_pkt: 0,
            end_pkt: packets,
            title_pkt,
            in_time: 1000,
            out_time: 1000 + u64::from(packets) * 100,
            title_time,
            connection,
            still_mode: StillMode::None,
            still_time: 0,
            streams: StreamTable::default(),
            uo_mask: UoMask::default(),
        }
    }

    /// Two 64-packet clips (two aligned units each), non-seamless join.
    fn fixture() -> (MemSource, NavTitle) {
        let mut src = MemSource::new();
        let mut data = mk_unit(0x1011);
        data.extend_from_slice(&mk_unit(0x1011));
        src.insert("00001", data.clone());
        src.insert("00002", data);

        let c0 = clip("00001", 64, 0, 0, ClipConnection::Seamless);
        let c1 = clip("00002", 64, 64, 6400, ClipConnection::NonSeamless);
        let title = NavTitle {
            name: "00001.mpls".to_string(),
            angle: 1,
            angle_count: 1,
            clips: vec![c0, c1],
            chapters: Vec::new(),
            marks: Vec::new(),
            sub_paths: Vec::new(),
            uo_mask: UoMask::default(),
            packets: 128,
        };
        (src, title)
    }

    struct Harness {
        src: MemSource,
        regs: PsrBank,
        events: EventQueue,
        config: SessionConfig,
    }

    impl Harness {
        fn new(src: MemSource) -> Self {
            Self {
                src,
                regs: PsrBank::new(),
                events: EventQueue::new(),
                config: SessionConfig::default(),
            }
        }

        fn deps(&mut self) -> SessionDeps<'_> {
            SessionDeps {
                source: &self.src,
                regs: &self.regs,
                events: &mut self.events,
                gc: None,
                config: &self.config,
            }
        }

        fn drain_events(&mut self) -> Vec<Event> {
            std::iter::from_fn(|| self.events.pop()).collect()
        }
    }

    #[test]
    fn test_read_splits_at_clip_boundary() {
        let (src, title) = fixture();
        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");

        let mut buf = vec![0u8; 3 * ALIGNED_UNIT];
        // clip 0 holds exactly two units; the read stops at the boundary
        let n = session.read(&mut h.deps(), &mut buf).expect("read");
        assert_eq!(n, 2 * ALIGNED_UNIT);
        assert_eq!(session.title_pkt(), 64);

        // the next read switches clips and reports the discontinuity
        let n = session.read(&mut h.deps(), &mut buf).expect("read");
        assert!(n > 0);
        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::Discontinuity && e.param == 1000));
        assert_eq!(h.regs.read(PSR_PLAYITEM), 1);
    }

    #[test]
    fn test_end_of_title_is_idempotent() {
        let (src, title) = fixture();
        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");

        let mut buf = vec![0u8; ALIGNED_UNIT];
        while session.read(&mut h.deps(), &mut buf).expect("read") > 0 {}
        let first: Vec<Event> = h.drain_events();
        assert_eq!(
            first
                .iter()
                .filter(|e| e.kind == EventKind::EndOfTitle)
                .count(),
            1
        );

        // further reads stay at zero and stay silent
        assert_eq!(session.read(&mut h.deps(), &mut buf).expect("read"), 0);
        assert_eq!(session.read(&mut h.deps(), &mut buf).expect("read"), 0);
        assert!(h.drain_events().is_empty());
        assert_eq!(session.end_of_playlist() & 1, 1);
    }

    #[test]
    fn test_seek_updates_registers_and_queues_event() {
        let (src, title) = fixture();
        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");
        while h.regs.take_event().is_some() {}

        session.seek_pkt(&mut h.deps(), 70).expect("seek");
        assert!(h
            .drain_events()
            .iter()
            .any(|e| e.kind == EventKind::Seek && e.param == 70));
        assert_eq!(session.title_pkt(), 70);

        let psr_writes: Vec<_> = std::iter::from_fn(|| h.regs.take_event()).collect();
        assert!(psr_writes.iter().any(|e| e.psr == PSR_TIME));
        assert!(psr_writes
            .iter()
            .any(|e| e.psr == PSR_PLAYITEM && e.kind == PsrEventKind::Change));
    }

    #[test]
    fn test_seek_past_duration_rejected() {
        let (src, title) = fixture();
        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");
        let duration = session.title.duration();
        assert!(matches!(
            session.seek_time(&mut h.deps(), duration),
            Err(SessionError::SeekOutOfRange)
        ));
    }

    #[test]
    fn test_play_mark_crossing() {
        let (src, mut title) = fixture();
        title.marks = vec![PlayMark {
            kind: MarkKind::Entry,
            clip_index: 0,
            clip_pkt: 32,
            title_pkt: 32,
            tick: 0,
        }];
        title.chapters = title.marks.clone();
        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");

        let mut buf = vec![0u8; ALIGNED_UNIT];
        // first unit ends exactly at the mark
        let n = session.read(&mut h.deps(), &mut buf).expect("read");
        assert_eq!(n, 32 * TS_PACKET);
        assert!(h.drain_events().is_empty());

        // crossing the mark fires once, then reading continues
        let n = session.read(&mut h.deps(), &mut buf).expect("read");
        assert!(n > 0);
        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::PlayMark && e.param == 0));
    }

    #[test]
    fn test_close_reports_interrupted_playback() {
        let (src, title) = fixture();
        let mut h = Harness::new(src);

        // stopped mid-title: PLAYLIST_STOP expected
        let session = Session::open(title.clone(), &mut h.deps()).expect("open");
        session.close(&mut h.deps());
        assert!(h
            .drain_events()
            .iter()
            .any(|e| e.kind == EventKind::PlaylistStop));

        // stopped within the last 100 packets of the last clip: silence
        let mut session = Session::open(title, &mut h.deps()).expect("open");
        session.seek_pkt(&mut h.deps(), 127).expect("seek");
        h.drain_events();
        session.close(&mut h.deps());
        assert!(h
            .drain_events()
            .iter()
            .all(|e| e.kind != EventKind::PlaylistStop));
    }

    #[test]
    fn test_seamless_angle_change_applies_at_boundary() {
        let (mut src, mut title) = fixture();
        let mut data = mk_unit(0x1011);
        data.extend_from_slice(&mk_unit(0x1011));
        src.insert("00102", data);
        title.angle_count = 2;
        title.clips[1].angle_names = vec!["00102".to_string()];

        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");
        session.request_seamless_angle_change(2);

        let mut buf = vec![0u8; 2 * ALIGNED_UNIT];
        session.read(&mut h.deps(), &mut buf).expect("clip 0");
        session.read(&mut h.deps(), &mut buf).expect("boundary");

        assert_eq!(session.title.angle, 2);
        assert_eq!(h.regs.read(PSR_ANGLE_NUMBER), 2);
        assert_eq!(
            session.st0.as_ref().map(|st| st.clip_name().to_string()),
            Some("00102".to_string())
        );
    }

    #[test]
    fn test_explicit_seek_cancels_pending_angle() {
        let (mut src, mut title) = fixture();
        let mut data = mk_unit(0x1011);
        data.extend_from_slice(&mk_unit(0x1011));
        src.insert("00102", data);
        title.angle_count = 2;
        title.clips[1].angle_names = vec!["00102".to_string()];

        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");
        session.request_seamless_angle_change(2);
        session.seek_pkt(&mut h.deps(), 0).expect("seek");

        let mut buf = vec![0u8; 2 * ALIGNED_UNIT];
        session.read(&mut h.deps(), &mut buf).expect("clip 0");
        session.read(&mut h.deps(), &mut buf).expect("boundary");
        assert_eq!(session.title.angle, 1);
    }

    #[test]
    fn test_still_clip_holds_position() {
        let (src, mut title) = fixture();
        title.clips[0].still_mode = StillMode::Time;
        title.clips[0].still_time = 5;

        let mut h = Harness::new(src);
        let mut session = Session::open(title, &mut h.deps()).expect("open");

        let mut buf = vec![0u8; 3 * ALIGNED_UNIT];
        session.read(&mut h.deps(), &mut buf).expect("clip 0");
        assert_eq!(session.read(&mut h.deps(), &mut buf).expect("still"), 0);
        assert!(h
            .drain_events()
            .iter()
            .any(|e| e.kind == EventKind::StillTime && e.param == 5));

        assert!(session.skip_still(&mut h.deps()).expect("skip"));
        let n = session.read(&mut h.deps(), &mut buf).expect("next clip");
        assert!(n > 0);
    }
}
