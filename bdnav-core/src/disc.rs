//! Disc access layer.
//!
//! Features:
//! - Clip stream access behind `ClipSource`/`ClipFile` traits
//! - Directory-backed source for mounted BDMV trees
//! - In-memory source for tests
//! - Disc summary info (title list, encryption status)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiscError {
    #[error("clip {0:?} not found")]
    ClipNotFound(String),
    #[error("io error on clip {clip:?}: {source}")]
    Io {
        clip: String,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Disc Info
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscInfo {
    pub volume_id: Option<String>,
    pub num_titles: u32,
    pub titles: Vec<TitleEntry>,
    /// First-play title present in the index table.
    pub first_play_supported: bool,
    pub top_menu_supported: bool,
    pub aacs_detected: bool,
    pub bdplus_detected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleEntry {
    pub number: u32,
    /// Movie-object or application id backing this title.
    pub id_ref: u32,
    pub interactive: bool,
    pub bdj: bool,
    pub accessible: bool,
}

impl DiscInfo {
    pub fn title(&self, number: u32) -> Option<&TitleEntry> {
        self.titles.iter().find(|t| t.number == number)
    }
}

// ============================================================================
// Clip Access Traits
// ============================================================================

/// One open clip stream. Implementations need not buffer; the cursor reads
/// whole aligned units.
pub trait ClipFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DiscError>;
    fn seek(&mut self, pos: u64) -> Result<u64, DiscError>;
    fn size(&self) -> u64;
}

/// Opens clip streams by their 5-digit name (file stem, without extension).
pub trait ClipSource: Send {
    fn open_clip(&self, name: &str) -> Result<Box<dyn ClipFile>, DiscError>;
}

// ============================================================================
// Directory Source
// ============================================================================

/// Clip source reading `BDMV/STREAM/<name>.m2ts` from a mounted directory.
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn stream_dir(&self) -> PathBuf {
        self.root.join("BDMV").join("STREAM")
    }
}

impl ClipSource for DirSource {
    fn open_clip(&self, name: &str) -> Result<Box<dyn ClipFile>, DiscError> {
        let path = self.stream_dir().join(format!("{name}.m2ts"));
        debug!(clip = name, path = %path.display(), "opening clip");
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DiscError::ClipNotFound(name.to_string())
            } else {
                DiscError::Io {
                    clip: name.to_string(),
                    source: e,
                }
            }
        })?;
        let size = file
            .metadata()
            .map_err(|e| DiscError::Io {
                clip: name.to_string(),
                source: e,
            })?
            .len();
        Ok(Box::new(FileClip {
            name: name.to_string(),
            file,
            size,
        }))
    }
}

struct FileClip {
    name: String,
    file: File,
    size: u64,
}

impl FileClip {
    fn io_err(&self, e: std::io::Error) -> DiscError {
        DiscError::Io {
            clip: self.name.clone(),
            source: e,
        }
    }
}

impl ClipFile for FileClip {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DiscError> {
        let mut total = 0;
        // read_exact would error at EOF; accumulate short reads instead
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_err(e)),
            }
        }
        Ok(total)
    }

    fn seek(&mut self, pos: u64) -> Result<u64, DiscError> {
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| self.io_err(e))
    }

    fn size(&self) -> u64 {
        self.size
    }
}

// ============================================================================
// In-Memory Source
// ============================================================================

/// Clip source over in-memory buffers.
#[derive(Default)]
pub struct MemSource {
    clips: HashMap<String, Vec<u8>>,
}

impl MemSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.clips.insert(name.into(), data);
    }
}

impl ClipSource for MemSource {
    fn open_clip(&self, name: &str) -> Result<Box<dyn ClipFile>, DiscError> {
        let data = self
            .clips
            .get(name)
            .cloned()
            .ok_or_else(|| DiscError::ClipNotFound(name.to_string()))?;
        Ok(Box::new(MemClip { data, pos: 0 }))
    }
}

struct MemClip {
    data: Vec<u8>,
    pos: usize,
}

impl ClipFile for MemClip {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DiscError> {
        let avail = self.data.len().saturating_sub(self.pos);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> Result<u64, DiscError> {
        self.pos = (pos as usize).min(self.data.len());
        Ok(self.pos as u64)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_dir_source_reads_stream_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stream = tmp.path().join("BDMV").join("STREAM");
        fs::create_dir_all(&stream).expect("mkdir");
        fs::write(stream.join("00001.m2ts"), vec![0xab; 300]).expect("write");

        let src = DirSource::new(tmp.path());
        let mut clip = src.open_clip("00001").expect("open");
        assert_eq!(clip.size(), 300);

        let mut buf = [0u8; 200];
        assert_eq!(clip.read(&mut buf).expect("read"), 200);
        assert!(buf.iter().all(|&b| b == 0xab));

        clip.seek(250).expect("seek");
        assert_eq!(clip.read(&mut buf).expect("short read"), 50);
    }

    #[test]
    fn test_dir_source_missing_clip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("BDMV").join("STREAM")).expect("mkdir");
        let src = DirSource::new(tmp.path());
        assert!(matches!(
            src.open_clip("99999"),
            Err(DiscError::ClipNotFound(_))
        ));
    }

    #[test]
    fn test_mem_source_seek_and_eof() {
        let mut src = MemSource::new();
        src.insert("00001", (0..=99).collect());

        let mut clip = src.open_clip("00001").expect("open");
        clip.seek(90).expect("seek");
        let mut buf = [0u8; 20];
        assert_eq!(clip.read(&mut buf).expect("read"), 10);
        assert_eq!(buf[0], 90);
        assert_eq!(clip.read(&mut buf).expect("eof read"), 0);
    }

    #[test]
    fn test_disc_info_title_lookup() {
        let info = DiscInfo {
            num_titles: 1,
            titles: vec![TitleEntry {
                number: 1,
                id_ref: 0,
                interactive: false,
                bdj: false,
                accessible: true,
            }],
            ..Default::default()
        };
        assert!(info.title(1).is_some());
        assert!(info.title(2).is_none());
    }
}
