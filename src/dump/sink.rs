//! Transfer sinks.
//!
//! A sink receives one output file at a time: `begin_file`, ordered
//! `write` calls, then `end_file` (or `cancel`, which must leave nothing
//! behind). The NSP builder additionally needs `rewind_and_write_header`
//! to back-patch the partition header once every payload has streamed.
//!
//! Two production sinks exist: the local filesystem sink below (with
//! FAT32-style large-file splitting) and the USB host sink in
//! [`crate::dump::usb`]. [`RecordingSink`] captures every call for tests.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// FAT32 single-file ceiling (4 GiB - 1).
pub const FAT32_FILE_SIZE_LIMIT: u64 = 0xFFFF_FFFF;
/// Size of each piece when splitting (4 GiB minus one media block, the
/// concatenation-friendly value).
pub const SPLIT_PIECE_SIZE: u64 = 0xFFFF_0000;

pub trait Sink {
    /// Announces the next output file. `header_reserve_size` is non-zero
    /// only for NSP builds, where the sink must leave room at offset 0 for
    /// a header delivered at the end.
    fn begin_file(&mut self, name: &str, total_size: u64, header_reserve_size: u32)
    -> Result<(), Error>;

    /// NSP builds only: announces the next entry inside the current file.
    /// Local sinks need no boundaries; the USB sink forwards them to the
    /// host as per-entry file-properties exchanges.
    fn begin_entry(&mut self, _name: &str, _size: u64) -> Result<(), Error> {
        Ok(())
    }

    /// Appends bytes to the current file, in order.
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Finishes the current file.
    fn end_file(&mut self) -> Result<(), Error>;

    /// Aborts the current file; no partial output may remain.
    fn cancel(&mut self) -> Result<(), Error>;

    /// NSP builds only: writes the finalised partition header at offset 0.
    fn rewind_and_write_header(&mut self, header: &[u8]) -> Result<(), Error>;
}

enum FileBacking {
    /// Plain single file.
    Single { path: PathBuf, file: File },
    /// Split into fixed-size pieces inside a directory named as the file.
    Split {
        dir: PathBuf,
        current: Option<File>,
        piece_index: u32,
        piece_written: u64,
    },
}

/// Local-filesystem sink with optional FAT32-style splitting.
pub struct FileSink {
    root: PathBuf,
    /// Single-file size ceiling reported by the filesystem, if any.
    file_size_limit: Option<u64>,
    /// Whether the filesystem supports the split-file convention.
    supports_split: bool,
    /// Free space reported by the host, checked before starting a file.
    free_space: Option<u64>,
    /// Byte size of each split piece.
    piece_size: u64,
    backing: Option<FileBacking>,
    written: u64,
    total_size: u64,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_size_limit: None,
            supports_split: false,
            free_space: None,
            piece_size: SPLIT_PIECE_SIZE,
            backing: None,
            written: 0,
            total_size: 0,
        }
    }

    /// Configures FAT32 behaviour: a 4-GiB single-file limit with the
    /// split-file convention available.
    pub fn with_fat32_limits(mut self) -> Self {
        self.file_size_limit = Some(FAT32_FILE_SIZE_LIMIT);
        self.supports_split = true;
        self
    }

    pub fn with_free_space(mut self, free_space: u64) -> Self {
        self.free_space = Some(free_space);
        self
    }

    fn open_next_piece(dir: &Path, piece_index: u32) -> Result<File, Error> {
        let path = dir.join(format!("{:02}", piece_index));
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::SinkIoError(format!("create piece {:?}: {}", path, e)))
    }

    fn remove_output(&mut self) {
        match self.backing.take() {
            Some(FileBacking::Single { path, file }) => {
                drop(file);
                let _ = fs::remove_file(path);
            }
            Some(FileBacking::Split { dir, current, .. }) => {
                drop(current);
                let _ = fs::remove_dir_all(dir);
            }
            None => {}
        }
    }
}

impl Sink for FileSink {
    fn begin_file(
        &mut self,
        name: &str,
        total_size: u64,
        header_reserve_size: u32,
    ) -> Result<(), Error> {
        if self.backing.is_some() {
            return Err(Error::InvalidState("previous file still open".into()));
        }
        if let Some(free) = self.free_space {
            if total_size > free {
                return Err(Error::SinkUnavailable(format!(
                    "not enough free space: need {}, have {}",
                    crate::util::format_size(total_size),
                    crate::util::format_size(free),
                )));
            }
        }

        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::SinkIoError(format!("create parent dirs: {}", e)))?;
        }

        let needs_split = self
            .file_size_limit
            .is_some_and(|limit| total_size > limit);

        let backing = if needs_split {
            if !self.supports_split {
                return Err(Error::FileTooLargeForFilesystem(total_size));
            }
            fs::create_dir_all(&path)
                .map_err(|e| Error::SinkIoError(format!("create split dir: {}", e)))?;
            let current = Self::open_next_piece(&path, 0)?;
            FileBacking::Split {
                dir: path,
                current: Some(current),
                piece_index: 0,
                piece_written: 0,
            }
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| Error::SinkIoError(format!("create {:?}: {}", path, e)))?;
            FileBacking::Single { path, file }
        };

        self.backing = Some(backing);
        self.written = 0;
        self.total_size = total_size;

        // NSP builds stream payload only; the header region is reserved
        // here and back-patched at the end.
        if header_reserve_size > 0 {
            self.write(&vec![0u8; header_reserve_size as usize])?;
        }

        tracing::trace!(name, total_size, needs_split, "file sink opened");
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let self_piece_size = self.piece_size;
        let backing = self
            .backing
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no file open".into()))?;

        match backing {
            FileBacking::Single { file, .. } => {
                file.write_all(buf)
                    .map_err(|e| Error::SinkIoError(format!("write: {}", e)))?;
            }
            FileBacking::Split {
                dir,
                current,
                piece_index,
                piece_written,
            } => {
                let piece_size = self_piece_size;
                let mut remaining = buf;
                while !remaining.is_empty() {
                    if *piece_written == piece_size {
                        *piece_index += 1;
                        *piece_written = 0;
                        *current = Some(Self::open_next_piece(dir, *piece_index)?);
                    }
                    let room = (piece_size - *piece_written) as usize;
                    let n = remaining.len().min(room);
                    current
                        .as_mut()
                        .expect("piece open")
                        .write_all(&remaining[..n])
                        .map_err(|e| Error::SinkIoError(format!("write piece: {}", e)))?;
                    *piece_written += n as u64;
                    remaining = &remaining[n..];
                }
            }
        }

        self.written += buf.len() as u64;
        Ok(())
    }

    fn end_file(&mut self) -> Result<(), Error> {
        match self.backing.take() {
            Some(FileBacking::Single { file, .. }) => {
                file.sync_all()
                    .map_err(|e| Error::SinkIoError(format!("sync: {}", e)))?;
            }
            Some(FileBacking::Split { current, .. }) => {
                if let Some(file) = current {
                    file.sync_all()
                        .map_err(|e| Error::SinkIoError(format!("sync piece: {}", e)))?;
                }
            }
            None => return Err(Error::InvalidState("no file open".into())),
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), Error> {
        self.remove_output();
        Ok(())
    }

    fn rewind_and_write_header(&mut self, header: &[u8]) -> Result<(), Error> {
        let backing = self
            .backing
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no file open".into()))?;

        match backing {
            FileBacking::Single { file, .. } => {
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| Error::SinkIoError(format!("seek: {}", e)))?;
                file.write_all(header)
                    .map_err(|e| Error::SinkIoError(format!("write header: {}", e)))?;
                file.seek(SeekFrom::End(0))
                    .map_err(|e| Error::SinkIoError(format!("seek: {}", e)))?;
            }
            FileBacking::Split { dir, .. } => {
                // The header always fits inside piece 0.
                let path = dir.join("00");
                let mut file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| Error::SinkIoError(format!("open piece 0: {}", e)))?;
                file.write_all(header)
                    .map_err(|e| Error::SinkIoError(format!("write header: {}", e)))?;
            }
        }
        Ok(())
    }
}

/// Test sink recording every call and byte.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<String>,
    data: Vec<u8>,
    write_sizes: Vec<usize>,
    header: Option<Vec<u8>>,
    open: bool,
    cancelled: bool,
    fail_after: Option<usize>,
    writes_done: usize,
    pub last_name: Option<String>,
    pub last_total_size: u64,
    pub last_header_reserve: u32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the sink fail on the write after `n` successful ones.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_after = Some(n);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        self.write_sizes.clone()
    }

    pub fn header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The final file image: reserved/streamed bytes with the back-patched
    /// header applied at offset 0.
    pub fn final_image(&self) -> Vec<u8> {
        let mut image = self.data.clone();
        if let Some(header) = &self.header {
            let n = header.len().min(image.len());
            image[..n].copy_from_slice(&header[..n]);
        }
        image
    }
}

impl Sink for RecordingSink {
    fn begin_file(
        &mut self,
        name: &str,
        total_size: u64,
        header_reserve_size: u32,
    ) -> Result<(), Error> {
        self.events
            .push(format!("begin_file({}, {}, {})", name, total_size, header_reserve_size));
        self.open = true;
        self.cancelled = false;
        self.data.clear();
        self.write_sizes.clear();
        self.header = None;
        self.writes_done = 0;
        self.last_name = Some(name.to_string());
        self.last_total_size = total_size;
        self.last_header_reserve = header_reserve_size;
        // Mirror the local sink: the header region is reserved up front.
        self.data.extend(std::iter::repeat_n(0u8, header_reserve_size as usize));
        Ok(())
    }

    fn begin_entry(&mut self, name: &str, size: u64) -> Result<(), Error> {
        self.events.push(format!("begin_entry({}, {})", name, size));
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        if !self.open {
            return Err(Error::InvalidState("no file open".into()));
        }
        if let Some(limit) = self.fail_after {
            if self.writes_done >= limit {
                return Err(Error::SinkIoError("simulated write failure".into()));
            }
        }
        self.writes_done += 1;
        self.write_sizes.push(buf.len());
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn end_file(&mut self) -> Result<(), Error> {
        self.events.push("end_file".to_string());
        self.open = false;
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), Error> {
        self.events.push("cancel".to_string());
        self.open = false;
        self.cancelled = true;
        self.data.clear();
        Ok(())
    }

    fn rewind_and_write_header(&mut self, header: &[u8]) -> Result<(), Error> {
        self.events
            .push(format!("rewind_and_write_header({})", header.len()));
        self.header = Some(header.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nx-dump-sink-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_single_file_write_and_header_patch() {
        let root = temp_dir("single");
        let mut sink = FileSink::new(&root);

        // The 0x10-byte header region is reserved by the sink itself.
        sink.begin_file("out/archive.nsp", 0x30, 0x10).unwrap();
        sink.write(&[0xAA; 0x20]).unwrap();
        sink.rewind_and_write_header(&[0xBB; 0x10]).unwrap();
        sink.end_file().unwrap();

        let written = fs::read(root.join("out/archive.nsp")).unwrap();
        assert_eq!(written.len(), 0x30);
        assert_eq!(&written[..0x10], &[0xBB; 0x10]);
        assert_eq!(&written[0x10..], &[0xAA; 0x20]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_cancel_removes_partial_file() {
        let root = temp_dir("cancel");
        let mut sink = FileSink::new(&root);

        sink.begin_file("partial.xci", 0x100, 0).unwrap();
        sink.write(&[1, 2, 3]).unwrap();
        sink.cancel().unwrap();

        assert!(!root.join("partial.xci").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_free_space_precheck() {
        let root = temp_dir("space");
        let mut sink = FileSink::new(&root).with_free_space(0x100);
        assert!(matches!(
            sink.begin_file("big.xci", 0x200, 0),
            Err(Error::SinkUnavailable(_))
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_too_large_without_split_support() {
        let root = temp_dir("nosplit");
        let mut sink = FileSink::new(&root);
        sink.file_size_limit = Some(0x100);
        sink.supports_split = false;
        assert!(matches!(
            sink.begin_file("big.xci", 0x200, 0),
            Err(Error::FileTooLargeForFilesystem(0x200))
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_split_pieces_and_concatenation() {
        let root = temp_dir("split");
        let mut sink = FileSink::new(&root);
        sink.file_size_limit = Some(0x100);
        sink.supports_split = true;
        sink.piece_size = 0x180;

        // 0x400 bytes over 0x180-byte pieces: three pieces, none above
        // the limit, concatenation equal to the streamed bytes.
        let payload: Vec<u8> = (0..0x400u32).map(|i| (i % 251) as u8).collect();
        sink.begin_file("big.xci", payload.len() as u64, 0).unwrap();
        sink.write(&payload[..0x200]).unwrap();
        sink.write(&payload[0x200..]).unwrap();
        sink.end_file().unwrap();

        let mut concatenated = Vec::new();
        for i in 0..3 {
            let piece = fs::read(root.join("big.xci").join(format!("{:02}", i))).unwrap();
            assert!(piece.len() as u64 <= 0x180);
            concatenated.extend_from_slice(&piece);
        }
        assert_eq!(concatenated, payload);
        assert!(!root.join("big.xci").join("03").exists());

        sink.begin_file("gone.xci", 0x200, 0).unwrap();
        sink.write(&[1]).unwrap();
        sink.cancel().unwrap();
        assert!(!root.join("gone.xci").exists());

        let _ = fs::remove_dir_all(root);
    }
}
