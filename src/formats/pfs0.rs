//! # Nintendo PFS0 / HFS0 (PartitionFS) format
//!
//! The Partition File System is a flat archive of named byte strings, used
//! everywhere the Switch packages files: NSP bundles are PFS0 images, and
//! gamecard partitions are the hashed HFS0 variant whose entries carry a
//! SHA-256 over a prefix of their data.
//!
//! Reading parses the header, entries and string table up front and
//! streams entry data on demand. Building is the NSP pipeline's half:
//! entries are declared in order with their final sizes, the header is
//! emitted once (optionally after renaming entries whose content IDs
//! changed mid-stream), and the payload follows.

use std::io::{Read, Seek, SeekFrom};

use binrw::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::Error;

// NSP (Nintendo Submission Package) files are simply PFS0 images packed
// for distribution.
pub type Nsp<R> = Pfs0<R>;

pub const PFS0_MAGIC: [u8; 4] = *b"PFS0";
pub const HFS0_MAGIC: [u8; 4] = *b"HFS0";

const PFS0_ENTRY_SIZE: u64 = 0x18;
const HFS0_ENTRY_SIZE: u64 = 0x40;
const HEADER_ALIGNMENT: u64 = 0x20;

/// Which on-disk flavour a partition image uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFsVariant {
    Pfs0,
    Hfs0,
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
/// Shared fixed header: magic, entry count, string table size, reserved.
pub struct Pfs0Header {
    pub magic: [u8; 4],
    /// Number of files contained in this partition image
    pub num_files: u32,
    /// Size of the string table in bytes
    pub str_table_size: u32,
    /// Reserved field, typically set to zeros
    pub reserved: [u8; 4],
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
/// PFS0 file entry record (0x18 bytes).
///
/// `data_offset` is relative to the start of the file data section, which
/// begins after the header, all entries and the string table.
pub struct Pfs0Entry {
    pub data_offset: u64,
    pub data_size: u64,
    pub string_table_offset: u32,
    pub reserved: [u8; 4],
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
/// HFS0 file entry record (0x40 bytes). The first `hashed_region_size`
/// bytes of the entry data hash to `hash`.
pub struct Hfs0Entry {
    pub data_offset: u64,
    pub data_size: u64,
    pub string_table_offset: u32,
    pub hashed_region_size: u32,
    pub reserved: [u8; 8],
    pub hash: [u8; 0x20],
}

#[derive(Debug, Clone)]
/// Represents a file within the partition image with both metadata and name
pub struct Pfs0File {
    /// Filename extracted from the string table
    pub name: String,
    /// Offset to file data, relative to the data section
    pub data_offset: u64,
    /// Size of the file data in bytes
    pub data_size: u64,
    /// HFS0 only: size of the hashed prefix region
    pub hashed_region_size: Option<u32>,
    /// HFS0 only: SHA-256 over the hashed prefix
    pub hash: Option<[u8; 0x20]>,
    /// Whether the hashed region has been verified yet
    hash_verified: bool,
}

/// Main structure for working with partition images (PFS0 and HFS0).
pub struct Pfs0<R: Read + Seek> {
    pub reader: R,
    pub variant: PartitionFsVariant,
    pub header: Pfs0Header,
    pub files: Vec<Pfs0File>,
    /// Absolute offset of the data section within the reader.
    data_start_offset: u64,
}

impl<R: Read + Seek> Pfs0<R> {
    /// Parse a partition image from a reader, accepting both variants.
    pub fn from_reader(mut reader: R) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(0))?;
        let header: Pfs0Header = reader.read_le()?;

        let variant = match header.magic {
            PFS0_MAGIC => PartitionFsVariant::Pfs0,
            HFS0_MAGIC => PartitionFsVariant::Hfs0,
            other => {
                return Err(Error::InvalidNca(format!(
                    "bad partition FS magic {:02X?}",
                    other
                )));
            }
        };

        let entry_size = match variant {
            PartitionFsVariant::Pfs0 => PFS0_ENTRY_SIZE,
            PartitionFsVariant::Hfs0 => HFS0_ENTRY_SIZE,
        };

        let mut raw_entries = Vec::with_capacity(header.num_files as usize);
        for _ in 0..header.num_files {
            match variant {
                PartitionFsVariant::Pfs0 => {
                    let e: Pfs0Entry = reader.read_le()?;
                    raw_entries.push((e.data_offset, e.data_size, e.string_table_offset, None, None));
                }
                PartitionFsVariant::Hfs0 => {
                    let e: Hfs0Entry = reader.read_le()?;
                    raw_entries.push((
                        e.data_offset,
                        e.data_size,
                        e.string_table_offset,
                        Some(e.hashed_region_size),
                        Some(e.hash),
                    ));
                }
            }
        }

        let mut string_table = vec![0u8; header.str_table_size as usize];
        reader.read_exact(&mut string_table)?;

        let data_start_offset =
            0x10 + entry_size * header.num_files as u64 + header.str_table_size as u64;

        let image_end = reader.seek(SeekFrom::End(0))?;

        let mut files = Vec::with_capacity(raw_entries.len());
        for (data_offset, data_size, name_offset, hashed_region_size, hash) in raw_entries {
            let name = read_string_table_name(&string_table, name_offset as usize)?;

            // Every entry must land inside the data body.
            if data_start_offset + data_offset + data_size > image_end {
                return Err(Error::InvalidNca(format!(
                    "partition entry '{}' exceeds image bounds",
                    name
                )));
            }

            files.push(Pfs0File {
                name,
                data_offset,
                data_size,
                hashed_region_size,
                hash,
                hash_verified: false,
            });
        }

        tracing::trace!(
            variant = ?variant,
            file_count = files.len(),
            "partition FS opened"
        );

        Ok(Self {
            reader,
            variant,
            header,
            files,
            data_start_offset,
        })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn list_files(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn get_entry(&self, index: usize) -> Option<&Pfs0File> {
        self.files.get(index)
    }

    pub fn get_entry_by_name(&self, name: &str) -> Option<(usize, &Pfs0File)> {
        self.files
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    /// Offset of an entry's data within the partition image itself
    /// (header + entries + string table + data offset).
    pub fn entry_image_offset(&self, index: usize) -> Option<u64> {
        self.files
            .get(index)
            .map(|f| self.data_start_offset + f.data_offset)
    }

    /// A PFS section counts as an ExeFS when it carries the usual loader
    /// entries.
    pub fn is_exefs(&self) -> bool {
        self.files
            .iter()
            .any(|f| matches!(f.name.as_str(), "main" | "main.npdm" | "rtld"))
    }

    /// Reads part of an entry's data, verifying the HFS0 hashed region on
    /// first access.
    pub fn read_entry_data(
        &mut self,
        index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        self.verify_hashed_region(index)?;

        let file = self
            .files
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("partition entry {}", index)))?;

        if offset + buf.len() as u64 > file.data_size {
            return Err(Error::InvalidArgument("read past entry end".into()));
        }

        let abs = self.data_start_offset + file.data_offset + offset;
        self.reader.seek(SeekFrom::Start(abs))?;
        self.reader.read_exact(buf)?;
        Ok(())
    }

    /// Extract a whole file from the image by its name.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let (index, file) = self
            .get_entry_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", name)))?;
        let size = file.data_size as usize;

        let mut data = vec![0u8; size];
        self.read_entry_data(index, 0, &mut data)?;
        Ok(data)
    }

    fn verify_hashed_region(&mut self, index: usize) -> Result<(), Error> {
        let (hashed_size, expected, data_offset) = {
            let file = self
                .files
                .get(index)
                .ok_or_else(|| Error::NotFound(format!("partition entry {}", index)))?;
            if file.hash_verified {
                return Ok(());
            }
            match (file.hashed_region_size, file.hash) {
                (Some(size), Some(hash)) if size > 0 => (size, hash, file.data_offset),
                _ => {
                    self.files[index].hash_verified = true;
                    return Ok(());
                }
            }
        };

        let abs = self.data_start_offset + data_offset;
        self.reader.seek(SeekFrom::Start(abs))?;
        let mut region = vec![0u8; hashed_size as usize];
        self.reader.read_exact(&mut region)?;

        let actual: [u8; 0x20] = Sha256::digest(&region).into();
        if actual != expected {
            return Err(Error::CorruptNca(format!(
                "HFS0 hashed region mismatch for '{}'",
                self.files[index].name
            )));
        }

        self.files[index].hash_verified = true;
        Ok(())
    }
}

fn read_string_table_name(string_table: &[u8], name_start: usize) -> Result<String, Error> {
    if name_start >= string_table.len() {
        return Err(Error::InvalidNca("name offset outside string table".into()));
    }
    let name_end = string_table[name_start..]
        .iter()
        .position(|&x| x == 0)
        .map(|p| name_start + p)
        .unwrap_or(string_table.len());

    Ok(std::str::from_utf8(&string_table[name_start..name_end])?.to_string())
}

/// Builder-mode PFS0: declare entries in order, then emit a header whose
/// byte length is 0x20-aligned via string-table padding.
#[derive(Debug, Default)]
pub struct Pfs0Builder {
    entries: Vec<(String, u64)>,
}

impl Pfs0Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry; returns its index. Entry order is preserved in the
    /// emitted image.
    pub fn add_entry(&mut self, name: impl Into<String>, size: u64) -> usize {
        self.entries.push((name.into(), size));
        self.entries.len() - 1
    }

    /// Renames an entry before header emission (used when a mutated NCA's
    /// content ID changes mid-stream).
    pub fn update_entry_name(&mut self, index: usize, new_name: impl Into<String>) -> Result<(), Error> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| Error::NotFound(format!("builder entry {}", index)))?;
        entry.0 = new_name.into();
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Data offset of entry `index` relative to the data section.
    pub fn entry_offset(&self, index: usize) -> u64 {
        self.entries[..index].iter().map(|(_, size)| size).sum()
    }

    /// Total payload byte count that must follow the header.
    pub fn fs_size(&self) -> u64 {
        self.entries.iter().map(|(_, size)| size).sum()
    }

    fn string_table_size(&self) -> u64 {
        let raw: u64 = self
            .entries
            .iter()
            .map(|(name, _)| name.len() as u64 + 1)
            .sum();
        let unpadded = 0x10 + PFS0_ENTRY_SIZE * self.entries.len() as u64 + raw;
        let padded = crate::io::align_up(unpadded, HEADER_ALIGNMENT);
        raw + (padded - unpadded)
    }

    /// Byte size of the emitted header.
    pub fn header_size(&self) -> u64 {
        0x10 + PFS0_ENTRY_SIZE * self.entries.len() as u64 + self.string_table_size()
    }

    /// Emits the header: magic, counts, entry records, string table.
    pub fn write_header(&self) -> Result<Vec<u8>, Error> {
        let str_table_size = self.string_table_size();
        let mut cursor = binrw::io::Cursor::new(Vec::new());

        let header = Pfs0Header {
            magic: PFS0_MAGIC,
            num_files: self.entries.len() as u32,
            str_table_size: str_table_size as u32,
            reserved: [0; 4],
        };
        header.write_le(&mut cursor)?;

        let mut name_offset = 0u32;
        let mut data_offset = 0u64;
        for (name, size) in &self.entries {
            let entry = Pfs0Entry {
                data_offset,
                data_size: *size,
                string_table_offset: name_offset,
                reserved: [0; 4],
            };
            entry.write_le(&mut cursor)?;
            name_offset += name.len() as u32 + 1;
            data_offset += size;
        }

        let mut out = cursor.into_inner();
        for (name, _) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out.resize(self.header_size() as usize, 0);

        Ok(out)
    }
}
