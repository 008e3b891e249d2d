//! Headless navigation front-end.
//!
//! Opens a mounted BDMV directory with a minimal navigator (one play item
//! per playlist, derived from the stream files), runs the read/event loop
//! and prints every navigation event. Useful for exercising the control
//! engine without a demuxer attached.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use bdnav_core::disc::{DirSource, DiscInfo, TitleEntry};
use bdnav_core::events::EventKind;
use bdnav_core::m2ts::{ALIGNED_UNIT, TS_PACKET};
use bdnav_core::nav::{
    ClipConnection, ClipInfo, NavError, NavTitle, Navigator, StillMode, StreamTable,
};
use bdnav_core::player::Player;
use bdnav_core::uo_mask::UoMask;

struct Args {
    root: PathBuf,
    playlist: u32,
    dump_info: bool,
}

fn usage() -> ! {
    eprintln!("usage: bdnav-player <bdmv-root> [--playlist N] [--dump-info]");
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut root = None;
    let mut playlist = 1;
    let mut dump_info = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--playlist" => {
                playlist = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            "--dump-info" => dump_info = true,
            "--help" | "-h" => usage(),
            _ if root.is_none() => root = Some(PathBuf::from(arg)),
            _ => usage(),
        }
    }

    Args {
        root: root.unwrap_or_else(|| usage()),
        playlist,
        dump_info,
    }
}

// ============================================================================
// Directory Navigator
// ============================================================================

/// Navigator that synthesizes one play item per stream file. Timing is
/// nominal (the real playlist tables are not parsed here); positions and
/// clip switching still behave like regular titles.
struct DirNavigator {
    stream_dir: PathBuf,
}

impl Navigator for DirNavigator {
    fn open_title(&mut self, name: &str, _angle: u8) -> Result<NavTitle, NavError> {
        let stem = name
            .strip_suffix(".mpls")
            .ok_or_else(|| NavError::TitleNotFound(name.to_string()))?;
        let path = self.stream_dir.join(format!("{stem}.m2ts"));
        let size = fs::metadata(&path)
            .map_err(|_| NavError::TitleNotFound(name.to_string()))?
            .len();
        let packets = (size / TS_PACKET as u64) as u32;
        if packets == 0 {
            return Err(NavError::Malformed(name.to_string(), "empty stream".into()));
        }
        debug!(playlist = name, packets, "synthesized single-clip title");

        let clip = ClipInfo {
            name: stem.to_string(),
            angle_names: Vec::new(),
            start_pkt: 0,
            end_pkt: packets,
            title_pkt: 0,
            in_time: 0,
            out_time: u64::from(packets) * 100,
            title_time: 0,
            connection: ClipConnection::Seamless,
            still_mode: StillMode::None,
            still_time: 0,
            streams: StreamTable::default(),
            uo_mask: UoMask::default(),
        };
        Ok(NavTitle {
            name: name.to_string(),
            angle: 1,
            angle_count: 1,
            clips: vec![clip],
            chapters: Vec::new(),
            marks: Vec::new(),
            sub_paths: Vec::new(),
            uo_mask: UoMask::default(),
            packets,
        })
    }
}

/// Build a title list by scanning the stream directory.
fn scan_disc_info(stream_dir: &Path) -> Result<DiscInfo> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(stream_dir).context("reading BDMV/STREAM")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".m2ts") {
            if let Ok(n) = stem.parse::<u32>() {
                numbers.push(n);
            }
        }
    }
    numbers.sort_unstable();

    let titles: Vec<TitleEntry> = numbers
        .iter()
        .enumerate()
        .map(|(i, &n)| TitleEntry {
            number: i as u32 + 1,
            id_ref: n,
            interactive: false,
            bdj: false,
            accessible: true,
        })
        .collect();
    Ok(DiscInfo {
        num_titles: titles.len() as u32,
        titles,
        ..Default::default()
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    let stream_dir = args.root.join("BDMV").join("STREAM");
    if !stream_dir.is_dir() {
        bail!("{} is not a BDMV directory", args.root.display());
    }

    let disc_info = scan_disc_info(&stream_dir)?;
    if args.dump_info {
        println!("{}", serde_json::to_string_pretty(&disc_info)?);
        return Ok(());
    }

    let player = Player::new(
        disc_info,
        Box::new(DirSource::new(&args.root)),
        Box::new(DirNavigator { stream_dir }),
    );

    if !player.select_playlist(args.playlist) {
        bail!("playlist {} could not be opened", args.playlist);
    }
    info!(playlist = args.playlist, "playback started");

    let mut buf = vec![0u8; ALIGNED_UNIT];
    let mut total = 0u64;
    loop {
        let (n, ev) = player.read_ext(&mut buf);
        if n < 0 {
            bail!("playback failed (last event: {:?})", ev.kind);
        }
        total += n as u64;
        match ev.kind {
            EventKind::None => {}
            kind => println!("event: {:?} ({})", kind, ev.param),
        }
        if ev.kind == EventKind::EndOfTitle {
            break;
        }
    }
    info!(bytes = total, "playback finished");
    println!("read {total} bytes");
    Ok(())
}
