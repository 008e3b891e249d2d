//! Aligned-unit stream reader.
//!
//! Features:
//! - 6144-byte aligned-unit reads over a `ClipFile`
//! - Unit validation (sync bytes, copy-permission encryption heuristic)
//! - Recoverable skip of broken units, fatal bail-out on encrypted streams
//! - Unit-aligned seeking with post-seek PAT/PMT/PCR rewind
//! - Optional per-unit stream filter driven by the declared stream table
//! - Whole-clip preload for out-of-mux sub-paths

use tracing::{debug, trace, warn};

use crate::disc::{ClipFile, ClipSource, DiscError};
use crate::events::{ErrorCode, EventKind, EventQueue};
use crate::nav::{ClipInfo, StreamTable};
use crate::uo_mask::UoMask;

// ============================================================================
// Constants
// ============================================================================

/// Source packet size: 4-byte TP_extra_header + 188-byte TS packet.
pub const TS_PACKET: usize = 192;
/// Aligned unit: the fixed read granularity, 32 source packets.
pub const ALIGNED_UNIT: usize = 6144;
pub const PKTS_PER_UNIT: usize = ALIGNED_UNIT / TS_PACKET;

const TS_SYNC: u8 = 0x47;
/// Sync-byte check offsets within a unit (first four source packets).
const SYNC_OFFSETS: [usize; 4] = [4, 196, 388, 580];

/// Highest PID that carries PSI/PCR data; packets at or below this bound
/// immediately before a seek point are rewound into the output.
pub const PCR_PID: u16 = 0x1001;

/// Consecutive suspected-encrypted units tolerated before giving up.
const ENCRYPTED_UNIT_THRESHOLD: u32 = 10;

/// Source packet number for a clip byte position.
pub fn spn(byte_pos: u64) -> u32 {
    (byte_pos / TS_PACKET as u64) as u32
}

/// PID of the TS packet starting at `pkt` (192-byte source packet).
pub fn ts_pid(pkt: &[u8]) -> u16 {
    (u16::from(pkt[5] & 0x1f) << 8) | u16::from(pkt[6])
}

// ============================================================================
// Stream Filter
// ============================================================================

/// Per-unit filter nulling out transport packets whose PID is not declared
/// in the play item's stream table. PSI and PCR packets always pass.
pub struct M2tsFilter {
    keep: Vec<u16>,
}

impl M2tsFilter {
    pub fn new(streams: &StreamTable) -> Self {
        let mut keep: Vec<u16> = streams
            .video
            .iter()
            .chain(&streams.audio)
            .chain(&streams.pg)
            .chain(&streams.ig)
            .chain(&streams.secondary_audio)
            .chain(&streams.secondary_video)
            .map(|s| s.pid)
            .collect();
        keep.sort_unstable();
        keep.dedup();
        Self { keep }
    }

    /// Rewrite one unit in place. Fails on malformed packet framing; the
    /// caller tears the filter down but still delivers the unit.
    pub fn feed_unit(&mut self, unit: &mut [u8]) -> Result<(), ()> {
        for pkt in unit.chunks_exact_mut(TS_PACKET) {
            if pkt[4] != TS_SYNC {
                return Err(());
            }
            let pid = ts_pid(pkt);
            if pid > PCR_PID && !self.keep.contains(&pid) {
                // retarget to the null PID, leave payload bytes alone
                pkt[5] = (pkt[5] & 0xe0) | 0x1f;
                pkt[6] = 0xff;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Stream Cursor
// ============================================================================

/// Outcome of one aligned-unit read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRead {
    /// A validated unit is in the buffer.
    Unit,
    /// No data this attempt (end of clip, or a broken unit was skipped).
    /// Events may be pending; the position has advanced past any bad unit.
    Empty,
    /// Unrecoverable (encrypted stream). The cursor must be closed.
    Fatal,
}

/// Read cursor over one clip stream. Owns the open file, the unit buffer
/// and all per-stream validation state.
pub struct StreamCursor {
    pub clip_index: usize,
    clip_name: String,
    file: Box<dyn ClipFile>,
    pub clip_size: u64,
    /// Unit-aligned file read position.
    pub clip_block_pos: u64,
    /// Logical byte position (packet granularity).
    pub clip_pos: u64,

    buf: Box<[u8; ALIGNED_UNIT]>,
    /// Valid bytes in `buf` (short final unit may be partial).
    buf_len: usize,
    /// Consumer offset into `buf`; == `buf_len` when a refill is due.
    pub buf_off: usize,

    pub uo_mask: UoMask,
    pub ig_pid: u16,
    pub pg_pid: u16,

    eof_hit: bool,
    encrypted_unit_cnt: u32,
    pub seek_flag: bool,
    filter: Option<M2tsFilter>,
}

impl StreamCursor {
    pub fn open(
        source: &dyn ClipSource,
        clip_index: usize,
        clip: &ClipInfo,
        angle: u8,
        filter: bool,
    ) -> Result<Self, DiscError> {
        let name = clip.name_for_angle(angle).to_string();
        let file = source.open_clip(&name)?;
        let clip_size = file.size();
        debug!(clip = %name, clip_size, "opened stream cursor");
        Ok(Self {
            clip_index,
            clip_name: name,
            file,
            clip_size,
            clip_block_pos: 0,
            clip_pos: 0,
            buf: Box::new([0; ALIGNED_UNIT]),
            buf_len: 0,
            buf_off: 0,
            uo_mask: clip.uo_mask,
            ig_pid: 0,
            pg_pid: 0,
            eof_hit: false,
            encrypted_unit_cnt: 0,
            seek_flag: false,
            filter: filter.then(|| M2tsFilter::new(&clip.streams)),
        })
    }

    pub fn clip_name(&self) -> &str {
        &self.clip_name
    }

    /// Current source packet number.
    pub fn spn(&self) -> u32 {
        spn(self.clip_pos)
    }

    pub fn needs_refill(&self) -> bool {
        self.buf_off >= self.buf_len
    }

    /// Unconsumed bytes of the current unit.
    pub fn unit(&self) -> &[u8] {
        &self.buf[self.buf_off..self.buf_len]
    }

    /// Consume `n` bytes of the current unit into `out`.
    pub fn consume(&mut self, out: &mut [u8], n: usize) {
        out[..n].copy_from_slice(&self.buf[self.buf_off..self.buf_off + n]);
        self.buf_off += n;
        self.clip_pos += n as u64;
    }

    fn reseek(&mut self) -> Result<(), DiscError> {
        self.file.seek(self.clip_block_pos).map(|_| ())
    }

    fn skip_unit(&mut self, events: &mut EventQueue) {
        events.push(EventKind::ReadError, 0);
        self.clip_block_pos += ALIGNED_UNIT as u64;
        self.clip_pos = self.clip_block_pos;
        let _ = self.reseek();
    }

    /// Validation per the copy-permission / sync-byte rules. Returns whether
    /// the unit may be delivered.
    fn validate_unit(&mut self, events: &mut EventQueue) -> UnitRead {
        let sync_ok = SYNC_OFFSETS
            .iter()
            .filter(|&&off| off < self.buf_len)
            .all(|&off| self.buf[off] == TS_SYNC);
        if !sync_ok {
            if self.buf[0] & 0xc0 != 0 && self.buf[4] == TS_SYNC {
                // copy-permission bits with an intact leading sync byte:
                // likely an encrypted stream, not plain corruption
                self.encrypted_unit_cnt += 1;
                if self.encrypted_unit_cnt > ENCRYPTED_UNIT_THRESHOLD {
                    warn!(clip = %self.clip_name, "stream appears encrypted, giving up");
                    events.push(EventKind::Encrypted, ErrorCode::Aacs as u32);
                    return UnitRead::Fatal;
                }
            }
            warn!(
                clip = %self.clip_name,
                pos = self.clip_block_pos,
                "broken aligned unit, skipping"
            );
            events.push(EventKind::ReadError, 1);
            self.clip_block_pos += ALIGNED_UNIT as u64;
            self.clip_pos = self.clip_block_pos;
            let _ = self.reseek();
            return UnitRead::Empty;
        }
        self.encrypted_unit_cnt = 0;
        self.eof_hit = false;
        UnitRead::Unit
    }

    /// Read and validate the aligned unit at the current block position.
    /// On success the whole unit is buffered and `buf_off` points at the
    /// logical position within it.
    pub fn read_unit(&mut self, events: &mut EventQueue) -> UnitRead {
        if self.clip_block_pos >= self.clip_size {
            if !self.eof_hit {
                self.eof_hit = true;
                debug!(clip = %self.clip_name, "end of clip stream");
            }
            // truncated or misreported clips must not stall the caller:
            // keep advancing one unit per attempt
            self.clip_block_pos += ALIGNED_UNIT as u64;
            self.clip_pos = self.clip_block_pos;
            return UnitRead::Empty;
        }

        let want = (ALIGNED_UNIT as u64).min(self.clip_size - self.clip_block_pos) as usize;
        let got = match self.file.read(&mut self.buf[..want]) {
            Ok(n) => n,
            Err(e) => {
                warn!(clip = %self.clip_name, error = %e, "clip read failed");
                self.skip_unit(events);
                return UnitRead::Empty;
            }
        };
        if got < want {
            warn!(clip = %self.clip_name, want, got, "short unit read, skipping");
            self.skip_unit(events);
            return UnitRead::Empty;
        }

        self.buf_len = want;
        match self.validate_unit(events) {
            UnitRead::Unit => {}
            other => return other,
        }

        if let Some(filter) = self.filter.as_mut() {
            if filter.feed_unit(&mut self.buf[..want]).is_err() {
                warn!(clip = %self.clip_name, "stream filter failed, disabling");
                self.filter = None;
            }
        }

        let unit_base = self.clip_block_pos;
        self.clip_block_pos += want as u64;
        // logical position may sit mid-unit right after a seek
        self.buf_off = (self.clip_pos - unit_base) as usize;
        trace!(clip = %self.clip_name, pos = unit_base, "unit ready");

        if self.seek_flag {
            self.rewind_to_psi();
            self.seek_flag = false;
        }
        UnitRead::Unit
    }

    /// Pull PSI/PCR packets immediately preceding the seek point back into
    /// the output so downstream demuxers resynchronize.
    fn rewind_to_psi(&mut self) {
        let mut i = self.buf_off / TS_PACKET;
        while i > 0 && ts_pid(&self.buf[(i - 1) * TS_PACKET..]) <= PCR_PID {
            i -= 1;
        }
        let rewound = self.buf_off - i * TS_PACKET;
        self.buf_off = i * TS_PACKET;
        self.clip_pos -= rewound as u64;
    }

    /// Position the cursor at a clip packet. The file position aligns down
    /// to the containing unit; the logical position keeps packet precision.
    pub fn seek_to_packet(&mut self, clip_pkt: u32) -> Result<u32, DiscError> {
        self.clip_pos = u64::from(clip_pkt) * TS_PACKET as u64;
        // 6144 is not a power of two; align by division, not masking
        self.clip_block_pos = (self.clip_pos / ALIGNED_UNIT as u64) * ALIGNED_UNIT as u64;
        self.file.seek(self.clip_block_pos)?;
        self.buf_len = 0;
        self.buf_off = 0;
        self.eof_hit = false;
        self.encrypted_unit_cnt = 0;
        self.seek_flag = true;
        trace!(clip = %self.clip_name, clip_pkt, "cursor seek");
        Ok(self.spn())
    }
}

// ============================================================================
// Sub-Path Preload
// ============================================================================

/// Fully-buffered out-of-mux clip (IG menus, text subtitles).
pub struct Preload {
    pub clip: ClipInfo,
    pub buf: Vec<u8>,
}

/// Read a whole sub-path clip into memory. Fails (with a log, no event)
/// when the clip exceeds `cap` bytes or any unit is unreadable.
pub fn preload_clip(
    source: &dyn ClipSource,
    clip: &ClipInfo,
    angle: u8,
    cap: u64,
    events: &mut EventQueue,
) -> Option<Preload> {
    let mut cursor = match StreamCursor::open(source, 0, clip, angle, false) {
        Ok(c) => c,
        Err(e) => {
            warn!(clip = %clip.name, error = %e, "sub-path clip open failed");
            return None;
        }
    };
    if cursor.clip_size > cap {
        warn!(
            clip = %clip.name,
            size = cursor.clip_size,
            cap,
            "sub-path clip exceeds preload cap"
        );
        return None;
    }

    let mut buf = Vec::with_capacity(cursor.clip_size as usize);
    while cursor.clip_block_pos < cursor.clip_size {
        match cursor.read_unit(events) {
            UnitRead::Unit => {
                let n = cursor.unit().len();
                buf.extend_from_slice(cursor.unit());
                cursor.buf_off += n;
                cursor.clip_pos += n as u64;
            }
            UnitRead::Empty => {
                warn!(clip = %clip.name, "sub-path preload read failed");
                return None;
            }
            UnitRead::Fatal => return None,
        }
    }
    debug!(clip = %clip.name, bytes = buf.len(), "sub-path clip preloaded");
    Some(Preload {
        clip: clip.clone(),
        buf,
    })
}
