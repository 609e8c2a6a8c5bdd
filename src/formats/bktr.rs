//! BKTR patch overlay: virtualises the RomFS of a patched title on top of
//! a base NCA and an update NCA.
//!
//! A PatchRomFs section carries two bucket-tree blocks after its payload:
//! an *indirect storage* block mapping virtual offsets of the patched image
//! to either the base NCA's RomFS or the update's own AES-CTR-Ex region,
//! and an *AES-CTR-Ex storage* block assigning per-range generation
//! counters that are mixed into the CTR nonce.
//!
//! The on-disk arrays are packed; after ingestion each bucket receives a
//! sentinel entry so lookups never need a bounds special case:
//! `last_entry.virtual_offset == block.virtual_size` and
//! `last_entry.physical_offset == section_size`. Interior buckets get a
//! sentinel carrying the next bucket's first key.

use binrw::prelude::*;
use std::io::{Read, Result as IoResult, Seek, SeekFrom};

use crate::error::Error;
use crate::formats::nca::{Nca, NcaFsSectionType};
use crate::formats::romfs::{FileEntry, RomFs};

/// Size of one on-disk bucket (and of the block header region).
const BKTR_BLOCK_UNIT: usize = 0x4000;

pub const BKTR_STORAGE_ORIGINAL: u32 = 0;
pub const BKTR_STORAGE_PATCH: u32 = 1;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectEntry {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    /// 0 = original (base RomFS), 1 = patch (AES-CTR-Ex region).
    pub storage_index: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesCtrExEntry {
    pub offset: u64,
    pub size: u32,
    pub generation: u32,
}

#[binrw]
#[brw(little)]
struct BlockHeaderRaw {
    _index: u32,
    bucket_count: u32,
    /// Virtual size (indirect) or physical size (AES-CTR-Ex).
    total_size: u64,
    #[br(count = 0x3FF0 / 8)]
    base_offsets: Vec<u64>,
}

#[binrw]
#[brw(little)]
struct IndirectBucketRaw {
    _index: u32,
    entry_count: u32,
    _end_offset: u64,
    #[br(count = 0x3FF0 / 0x14)]
    entries: Vec<IndirectEntry>,
    #[br(count = 0x3FF0 % 0x14)]
    _pad: Vec<u8>,
}

#[binrw]
#[brw(little)]
struct AesCtrExBucketRaw {
    _index: u32,
    entry_count: u32,
    _end_offset: u64,
    #[br(count = 0x3FF)]
    entries: Vec<AesCtrExEntry>,
}

/// One relocated bucket: its starting key plus its entries, sentinel
/// included (so `entries[i + 1]` is always the boundary of `entries[i]`).
#[derive(Debug)]
struct Bucket<E> {
    start: u64,
    entries: Vec<E>,
}

#[derive(Debug)]
struct LookupBlock<E> {
    buckets: Vec<Bucket<E>>,
}

impl<E> LookupBlock<E> {
    /// Two-step lookup: linear scan picks the bucket, binary search picks
    /// the entry. Returns the entry index pair (bucket, entry).
    fn locate(&self, offset: u64, key: impl Fn(&E) -> u64) -> Option<(&E, u64)> {
        let mut bucket_num = 0;
        for (i, bucket) in self.buckets.iter().enumerate().skip(1) {
            if bucket.start <= offset {
                bucket_num = i;
            }
        }
        let bucket = &self.buckets[bucket_num];
        if bucket.entries.len() < 2 {
            return None;
        }

        // Sentinel occupies the last slot; search the real entries.
        let entries = &bucket.entries;
        let mut low = 0usize;
        let mut high = entries.len() - 2;
        while low < high {
            let mid = (low + high + 1) / 2;
            if key(&entries[mid]) > offset {
                high = mid - 1;
            } else {
                low = mid;
            }
        }

        let entry = &entries[low];
        if key(entry) > offset {
            return None;
        }
        Some((entry, key(&entries[low + 1])))
    }
}

/// A patched-RomFS overlay over a base NCA and an update NCA.
pub struct Bktr<'a, R: Read + Seek> {
    base: &'a Nca<R>,
    base_section: usize,
    patch: &'a Nca<R>,
    patch_section: usize,
    indirect: LookupBlock<IndirectEntry>,
    aes_ctr_ex: LookupBlock<AesCtrExEntry>,
    virtual_size: u64,
    section_size: u64,
    /// Patched RomFS image offset/size within the virtual section.
    romfs_offset: u64,
    romfs_size: u64,
}

impl<'a, R: Read + Seek> Bktr<'a, R> {
    pub fn new(base: &'a Nca<R>, patch: &'a Nca<R>) -> Result<Self, Error> {
        let base_section = base
            .find_section(NcaFsSectionType::RomFs)
            .ok_or_else(|| Error::InvalidNca("base NCA has no RomFS section".into()))?;
        let patch_section = patch
            .find_section(NcaFsSectionType::PatchRomFs)
            .ok_or_else(|| Error::InvalidNca("update NCA has no PatchRomFs section".into()))?;

        if base.header.program_id != patch.header.program_id {
            return Err(Error::InvalidNca(
                "base and update NCAs belong to different programs".into(),
            ));
        }
        if base.header.content_type != patch.header.content_type {
            return Err(Error::InvalidNca(
                "base and update NCAs carry different content types".into(),
            ));
        }

        let patch_info = &patch_section.header.patch_info;
        if !patch_info.is_present() {
            return Err(Error::InvalidNca("update section lacks BKTR blocks".into()));
        }
        let section_size = patch_section.size;
        if patch_info.indirect.offset + patch_info.indirect.size != patch_info.aes_ctr_ex.offset
            || patch_info.aes_ctr_ex.offset + patch_info.aes_ctr_ex.size != section_size
        {
            return Err(Error::InvalidNca(
                "BKTR blocks do not tile the section tail".into(),
            ));
        }

        // Ingest both blocks through the plain section read path.
        let mut indirect_raw = vec![0u8; patch_info.indirect.size as usize];
        patch.read_section(
            patch_section.section_idx,
            patch_info.indirect.offset,
            &mut indirect_raw,
        )?;
        let mut ctr_ex_raw = vec![0u8; patch_info.aes_ctr_ex.size as usize];
        patch.read_section(
            patch_section.section_idx,
            patch_info.aes_ctr_ex.offset,
            &mut ctr_ex_raw,
        )?;

        let header_generation = (patch_section.header.ctr >> 32) as u32;

        let (indirect, virtual_size) = parse_indirect_block(&indirect_raw, section_size)?;
        let aes_ctr_ex = parse_aes_ctr_ex_block(
            &ctr_ex_raw,
            patch_info.indirect.offset,
            section_size,
            header_generation,
        )?;

        let (romfs_offset, romfs_size) = patch_section.data_layer();

        let bktr = Self {
            base,
            base_section: base_section.section_idx,
            patch,
            patch_section: patch_section.section_idx,
            indirect,
            aes_ctr_ex,
            virtual_size,
            section_size,
            romfs_offset,
            romfs_size,
        };

        // The patched RomFS header is itself served through the overlay;
        // probe it so a broken mapping fails here, not mid-dump.
        let mut probe = [0u8; 8];
        bktr.read_image(0, &mut probe)?;

        tracing::trace!(
            virtual_size = format!("{:#x}", virtual_size),
            romfs_offset = format!("{:#x}", romfs_offset),
            romfs_size = format!("{:#x}", romfs_size),
            "BKTR overlay initialised"
        );

        Ok(bktr)
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    pub fn romfs_size(&self) -> u64 {
        self.romfs_size
    }

    /// Reads from the virtual patched section image. `offset` is
    /// section-virtual (the address space the indirect block maps).
    pub fn read_virtual(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.virtual_size {
            return Err(Error::InvalidArgument("read past virtual image end".into()));
        }

        let (entry, next_virtual) = self
            .indirect
            .locate(offset, |e| e.virtual_offset)
            .ok_or_else(|| {
                Error::CorruptNca(format!("no indirect entry covers {:#x}", offset))
            })?;
        let entry = *entry;

        let end = offset + buf.len() as u64;
        if end <= next_virtual {
            let physical = entry.physical_offset + (offset - entry.virtual_offset);
            match entry.storage_index {
                BKTR_STORAGE_ORIGINAL => self.base.read_section(self.base_section, physical, buf),
                BKTR_STORAGE_PATCH => self.read_patch_region(physical, buf),
                other => Err(Error::CorruptNca(format!(
                    "invalid indirect storage index {}",
                    other
                ))),
            }
        } else {
            // Split at the next indirect entry and recurse on both halves.
            let first = (next_virtual - offset) as usize;
            let (a, b) = buf.split_at_mut(first);
            self.read_virtual(offset, a)?;
            self.read_virtual(next_virtual, b)
        }
    }

    /// Reads from the patch NCA's AES-CTR-Ex region at a section-physical
    /// offset, applying per-range generation counters.
    fn read_patch_region(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let (entry, next_offset) = self
            .aes_ctr_ex
            .locate(offset, |e| e.offset)
            .ok_or_else(|| {
                Error::CorruptNca(format!("no AES-CTR-Ex entry covers {:#x}", offset))
            })?;
        let entry = *entry;

        let end = offset + buf.len() as u64;
        if end <= next_offset {
            self.patch
                .read_section_ctr_ex(self.patch_section, offset, buf, entry.generation)
        } else {
            let first = (next_offset - offset) as usize;
            let (a, b) = buf.split_at_mut(first);
            self.read_patch_region(offset, a)?;
            self.read_patch_region(next_offset, b)
        }
    }

    /// Reads from the patched RomFS image (image-relative offsets).
    pub fn read_image(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if offset + buf.len() as u64 > self.romfs_size {
            return Err(Error::InvalidArgument("read past patched RomFS end".into()));
        }
        self.read_virtual(self.romfs_offset + offset, buf)
    }

    /// Opens the patched RomFS. All RomFS operations then resolve against
    /// the updated tables while file reads route through the overlay.
    pub fn open_romfs(&self) -> Result<RomFs<BktrCursor<'_, 'a, R>>, Error> {
        RomFs::from_reader(BktrCursor {
            bktr: self,
            position: 0,
        })
    }

    /// True when any byte of the file's data range comes from the patch.
    pub fn is_file_entry_updated(
        &self,
        romfs: &RomFs<BktrCursor<'_, 'a, R>>,
        entry: &FileEntry,
    ) -> Result<bool, Error> {
        let start =
            self.romfs_offset + romfs.header.file_data_offset + entry.data_offset;
        let end = start + entry.data_size;

        let mut offset = start;
        while offset < end {
            let (indirect, next_virtual) = self
                .indirect
                .locate(offset, |e| e.virtual_offset)
                .ok_or_else(|| {
                    Error::CorruptNca(format!("no indirect entry covers {:#x}", offset))
                })?;
            if indirect.storage_index == BKTR_STORAGE_PATCH {
                return Ok(true);
            }
            offset = next_virtual;
        }
        Ok(false)
    }
}

/// Read + Seek over the patched RomFS image.
pub struct BktrCursor<'b, 'a, R: Read + Seek> {
    bktr: &'b Bktr<'a, R>,
    position: u64,
}

impl<R: Read + Seek> Read for BktrCursor<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let size = self.bktr.romfs_size;
        if self.position >= size {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len() as u64, size - self.position) as usize;
        self.bktr
            .read_image(self.position, &mut buf[..n])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for BktrCursor<'_, '_, R> {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.bktr.romfs_size as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before image start",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

fn parse_indirect_block(
    raw: &[u8],
    section_size: u64,
) -> Result<(LookupBlock<IndirectEntry>, u64), Error> {
    let mut cursor = binrw::io::Cursor::new(raw);
    let header: BlockHeaderRaw = cursor.read_le()?;
    let virtual_size = header.total_size;

    if header.bucket_count == 0 {
        return Err(Error::InvalidNca("indirect block has no buckets".into()));
    }

    let mut buckets = Vec::with_capacity(header.bucket_count as usize);
    for i in 0..header.bucket_count as usize {
        let bucket_offset = BKTR_BLOCK_UNIT * (1 + i);
        if bucket_offset + BKTR_BLOCK_UNIT > raw.len() {
            return Err(Error::InvalidNca("indirect block truncated".into()));
        }
        let mut cursor = binrw::io::Cursor::new(&raw[bucket_offset..]);
        let bucket: IndirectBucketRaw = cursor.read_le()?;

        let mut entries: Vec<IndirectEntry> =
            bucket.entries[..bucket.entry_count as usize].to_vec();

        // Sentinel: interior buckets close at the next bucket's first key,
        // the final bucket closes the whole virtual space.
        let sentinel_virtual = if i + 1 < header.bucket_count as usize {
            header.base_offsets[i + 1]
        } else {
            virtual_size
        };
        entries.push(IndirectEntry {
            virtual_offset: sentinel_virtual,
            physical_offset: section_size,
            storage_index: BKTR_STORAGE_ORIGINAL,
        });

        buckets.push(Bucket {
            start: header.base_offsets[i],
            entries,
        });
    }

    Ok((LookupBlock { buckets }, virtual_size))
}

fn parse_aes_ctr_ex_block(
    raw: &[u8],
    indirect_offset: u64,
    section_size: u64,
    header_generation: u32,
) -> Result<LookupBlock<AesCtrExEntry>, Error> {
    let mut cursor = binrw::io::Cursor::new(raw);
    let header: BlockHeaderRaw = cursor.read_le()?;

    if header.bucket_count == 0 {
        return Err(Error::InvalidNca("AES-CTR-Ex block has no buckets".into()));
    }
    if header.total_size != indirect_offset {
        return Err(Error::InvalidNca(
            "AES-CTR-Ex block size does not match the patch data region".into(),
        ));
    }

    let mut raw_buckets = Vec::with_capacity(header.bucket_count as usize);
    for i in 0..header.bucket_count as usize {
        let bucket_offset = BKTR_BLOCK_UNIT * (1 + i);
        if bucket_offset + BKTR_BLOCK_UNIT > raw.len() {
            return Err(Error::InvalidNca("AES-CTR-Ex block truncated".into()));
        }
        let mut cursor = binrw::io::Cursor::new(&raw[bucket_offset..]);
        let bucket: AesCtrExBucketRaw = cursor.read_le()?;
        raw_buckets.push(bucket.entries[..bucket.entry_count as usize].to_vec());
    }

    let mut buckets = Vec::with_capacity(raw_buckets.len());
    for i in 0..raw_buckets.len() {
        let mut entries = raw_buckets[i].clone();
        if i + 1 < raw_buckets.len() {
            let next_first = raw_buckets[i + 1]
                .first()
                .ok_or_else(|| Error::InvalidNca("empty AES-CTR-Ex bucket".into()))?;
            entries.push(*next_first);
        } else {
            // The blocks region itself decrypts with the section's own
            // header generation; a final sentinel closes the section.
            entries.push(AesCtrExEntry {
                offset: indirect_offset,
                size: 0,
                generation: header_generation,
            });
            entries.push(AesCtrExEntry {
                offset: section_size,
                size: 0,
                generation: 0,
            });
        }
        buckets.push(Bucket {
            start: header.base_offsets[i],
            entries,
        });
    }

    Ok(LookupBlock { buckets })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::nca::test_fixtures::*;
    use crate::formats::nca::{
        BucketTreeHeader,
        ContentType, EncryptionType, FsEntry, FsHeader, FsType, HashData, HashType,
        HierarchicalIntegrityLevelInfo, InfoLevelHash, MetaDataHashType, Nca,
        NCA_FULL_HEADER_SIZE, NCA_MEDIA_BLOCK_SIZE, PatchInfo,
    };
    use crate::io::{apply_aes_ctr, apply_aes_ctr_ex};
    use crate::keys::Keyset;
    use std::io::Cursor;

    const BASE_SEED: u64 = 0x0101010101010101;
    const PATCH_SEED: u64 = 0x0000000300000042; // header generation 3
    const PATCH_GENERATION: u32 = 2;

    const VIRTUAL_SIZE: u64 = 0x10000;
    const PATCH_DATA_SIZE: u64 = 0x8000;
    const INDIRECT_OFFSET: u64 = PATCH_DATA_SIZE;
    const INDIRECT_SIZE: u64 = 0x8000;
    const CTR_EX_OFFSET: u64 = INDIRECT_OFFSET + INDIRECT_SIZE;
    const CTR_EX_SIZE: u64 = 0x8000;
    const PATCH_SECTION_SIZE: u64 = CTR_EX_OFFSET + CTR_EX_SIZE;

    fn serialize_indirect_block(entries: &[IndirectEntry]) -> Vec<u8> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        BlockHeaderRaw {
            _index: 0,
            bucket_count: 1,
            total_size: VIRTUAL_SIZE,
            base_offsets: vec![0u64; 0x3FF0 / 8],
        }
        .write_le(&mut cursor)
        .unwrap();

        let mut bucket_entries = entries.to_vec();
        bucket_entries.resize(
            0x3FF0 / 0x14,
            IndirectEntry {
                virtual_offset: 0,
                physical_offset: 0,
                storage_index: 0,
            },
        );
        IndirectBucketRaw {
            _index: 0,
            entry_count: entries.len() as u32,
            _end_offset: VIRTUAL_SIZE,
            entries: bucket_entries,
            _pad: vec![0; 0x3FF0 % 0x14],
        }
        .write_le(&mut cursor)
        .unwrap();
        cursor.into_inner()
    }

    fn serialize_ctr_ex_block(entries: &[AesCtrExEntry]) -> Vec<u8> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        BlockHeaderRaw {
            _index: 0,
            bucket_count: 1,
            total_size: PATCH_DATA_SIZE,
            base_offsets: vec![0u64; 0x3FF0 / 8],
        }
        .write_le(&mut cursor)
        .unwrap();

        let mut bucket_entries = entries.to_vec();
        bucket_entries.resize(
            0x3FF,
            AesCtrExEntry {
                offset: 0,
                size: 0,
                generation: 0,
            },
        );
        AesCtrExBucketRaw {
            _index: 0,
            entry_count: entries.len() as u32,
            _end_offset: PATCH_DATA_SIZE,
            entries: bucket_entries,
        }
        .write_le(&mut cursor)
        .unwrap();
        cursor.into_inner()
    }

    fn ivfc_hash_data(data_offset: u64, data_size: u64) -> HashData {
        let mut levels = vec![
            HierarchicalIntegrityLevelInfo {
                offset: 0,
                size: 0,
                block_size_log2: 14,
                _reserved: [0; 4],
            };
            6
        ];
        levels[5] = HierarchicalIntegrityLevelInfo {
            offset: data_offset,
            size: data_size,
            block_size_log2: 14,
            _reserved: [0; 4],
        };
        HashData::HierarchicalIntegrity {
            version: 0x20000,
            master_hash_size: 0x20,
            info_level_hash: InfoLevelHash {
                max_layers: 7,
                levels,
                signature_salt: [0; 0x20],
            },
            master_hash: [0; 0x20],
            _reserved: vec![0; 0x18],
        }
    }

    fn plain_fs_header(encryption: EncryptionType, seed: u64, hash_data: HashData, patch_info: PatchInfo) -> FsHeader {
        FsHeader {
            version: 2,
            fs_type: FsType::RomFs,
            hash_type: match hash_data {
                HashData::HierarchicalIntegrity { .. } => HashType::HierarchicalIntegrityHash,
                _ => HashType::None,
            },
            encryption_type: encryption,
            metadata_hash_type: MetaDataHashType::None,
            _reserved: [0; 2],
            hash_data,
            patch_info,
            ctr: seed,
            sparse_info: vec![0; 0x30],
            compression_info: vec![0; 0x28],
            metadata_hashdata_info: vec![0; 0x30],
            _reserved2: vec![0; 0x30],
        }
    }

    /// Builds the base/update NCA pair. The virtual patched image is
    /// `virtual_image` (0x10000 bytes), mapped as:
    ///   [0x0000, 0x4000) -> base physical 0x0000      (Original)
    ///   [0x4000, 0x8000) -> patch physical 0x0000     (Patch, generation 2)
    ///   [0x8000, 0x10000) -> base physical 0x4000     (Original)
    fn build_pair(virtual_image: &[u8]) -> (Vec<u8>, Vec<u8>, Keyset) {
        assert_eq!(virtual_image.len() as u64, VIRTUAL_SIZE);
        let keyset = test_keyset();
        let section_offset = NCA_FULL_HEADER_SIZE as u64;

        // Base NCA body: the two Original-mapped ranges, back to back.
        let mut base_body = vec![0u8; 0xC000];
        base_body[..0x4000].copy_from_slice(&virtual_image[..0x4000]);
        base_body[0x4000..0xC000].copy_from_slice(&virtual_image[0x8000..]);
        let mut base_encrypted = base_body;
        apply_aes_ctr(&TEST_CTR_KEY, BASE_SEED, section_offset, &mut base_encrypted);

        let base_fs = plain_fs_header(
            EncryptionType::AesCtr,
            BASE_SEED,
            HashData::None { _raw: vec![0; 0xF8] },
            PatchInfo::default(),
        );

        let mut base_header = test_header();
        base_header.content_type = ContentType::Program;
        base_header.encrypted_keys = encrypted_test_key_area(&keyset);
        base_header.fs_entries[0] = FsEntry {
            start_offset: (section_offset / NCA_MEDIA_BLOCK_SIZE) as u32,
            end_offset: ((section_offset + 0xC000) / NCA_MEDIA_BLOCK_SIZE) as u32,
            _reserved: 0,
        };
        let base_image = assemble_nca(base_header, &[(0, base_fs)], &base_encrypted, &keyset);

        // Patch NCA section plaintext: patch data, indirect block, CTR-Ex block.
        let mut patch_data = vec![0u8; PATCH_DATA_SIZE as usize];
        patch_data[..0x4000].copy_from_slice(&virtual_image[0x4000..0x8000]);

        let indirect_block = serialize_indirect_block(&[
            IndirectEntry { virtual_offset: 0, physical_offset: 0, storage_index: BKTR_STORAGE_ORIGINAL },
            IndirectEntry { virtual_offset: 0x4000, physical_offset: 0, storage_index: BKTR_STORAGE_PATCH },
            IndirectEntry { virtual_offset: 0x8000, physical_offset: 0x4000, storage_index: BKTR_STORAGE_ORIGINAL },
        ]);
        assert_eq!(indirect_block.len() as u64, INDIRECT_SIZE);

        let ctr_ex_block = serialize_ctr_ex_block(&[AesCtrExEntry {
            offset: 0,
            size: PATCH_DATA_SIZE as u32,
            generation: PATCH_GENERATION,
        }]);
        assert_eq!(ctr_ex_block.len() as u64, CTR_EX_SIZE);

        // Encrypt each region the way the reader will decrypt it.
        let mut section = vec![0u8; PATCH_SECTION_SIZE as usize];
        {
            let mut data = patch_data;
            apply_aes_ctr_ex(
                &TEST_CTR_KEY,
                PATCH_SEED,
                PATCH_GENERATION,
                section_offset,
                &mut data,
            );
            section[..PATCH_DATA_SIZE as usize].copy_from_slice(&data);
        }
        {
            let mut data = indirect_block;
            apply_aes_ctr(
                &TEST_CTR_KEY,
                PATCH_SEED,
                section_offset + INDIRECT_OFFSET,
                &mut data,
            );
            section[INDIRECT_OFFSET as usize..CTR_EX_OFFSET as usize].copy_from_slice(&data);
        }
        {
            let mut data = ctr_ex_block;
            apply_aes_ctr(
                &TEST_CTR_KEY,
                PATCH_SEED,
                section_offset + CTR_EX_OFFSET,
                &mut data,
            );
            section[CTR_EX_OFFSET as usize..].copy_from_slice(&data);
        }

        let patch_fs = plain_fs_header(
            EncryptionType::AesCtrEx,
            PATCH_SEED,
            ivfc_hash_data(0, VIRTUAL_SIZE),
            PatchInfo {
                indirect: BucketTreeHeader {
                    offset: INDIRECT_OFFSET,
                    size: INDIRECT_SIZE,
                    magic: *b"BKTR",
                    version: 1,
                    entry_count: 3,
                    _reserved: 0,
                },
                aes_ctr_ex: BucketTreeHeader {
                    offset: CTR_EX_OFFSET,
                    size: CTR_EX_SIZE,
                    magic: *b"BKTR",
                    version: 1,
                    entry_count: 1,
                    _reserved: 0,
                },
            },
        );

        let mut patch_header = test_header();
        patch_header.content_type = ContentType::Program;
        patch_header.encrypted_keys = encrypted_test_key_area(&keyset);
        patch_header.fs_entries[0] = FsEntry {
            start_offset: (section_offset / NCA_MEDIA_BLOCK_SIZE) as u32,
            end_offset: ((section_offset + PATCH_SECTION_SIZE) / NCA_MEDIA_BLOCK_SIZE) as u32,
            _reserved: 0,
        };
        let patch_image = assemble_nca(patch_header, &[(0, patch_fs)], &section, &keyset);

        (base_image, patch_image, keyset)
    }

    fn romfs_virtual_image() -> Vec<u8> {
        // small.bin sits below the patch window; big.bin crosses into it.
        let big = vec![0x42u8; 0x6000];
        let mut image = crate::formats::romfs::builder::build_romfs(&[
            ("/small.bin", &[0x11u8; 0x100]),
            ("/big.bin", &big),
        ]);
        assert!(image.len() as u64 <= VIRTUAL_SIZE);
        image.resize(VIRTUAL_SIZE as usize, 0);
        image
    }

    #[test]
    fn test_lookup_block_sentinels() {
        let raw = serialize_indirect_block(&[
            IndirectEntry { virtual_offset: 0, physical_offset: 0, storage_index: 0 },
            IndirectEntry { virtual_offset: 0x4000, physical_offset: 0, storage_index: 1 },
            IndirectEntry { virtual_offset: 0x8000, physical_offset: 0x4000, storage_index: 0 },
        ]);
        let (block, virtual_size) = parse_indirect_block(&raw, PATCH_SECTION_SIZE).unwrap();
        assert_eq!(virtual_size, VIRTUAL_SIZE);

        let (e, next) = block.locate(0, |e| e.virtual_offset).unwrap();
        assert_eq!((e.virtual_offset, next), (0, 0x4000));
        let (e, next) = block.locate(0x3FFF, |e| e.virtual_offset).unwrap();
        assert_eq!((e.virtual_offset, next), (0, 0x4000));
        let (e, next) = block.locate(0x5000, |e| e.virtual_offset).unwrap();
        assert_eq!((e.storage_index, next), (1, 0x8000));
        let (e, next) = block.locate(0xFFFF, |e| e.virtual_offset).unwrap();
        assert_eq!(e.virtual_offset, 0x8000);
        // Sentinel closes the block at the virtual size.
        assert_eq!(next, VIRTUAL_SIZE);
    }

    #[test]
    fn test_offset_mapping() {
        let virtual_image: Vec<u8> = (0..VIRTUAL_SIZE).map(|i| (i % 253) as u8).collect();
        let (base_image, patch_image, keyset) = build_pair(&virtual_image);

        let base = Nca::from_reader(Cursor::new(base_image), &keyset, None).unwrap();
        let patch = Nca::from_reader(Cursor::new(patch_image), &keyset, None).unwrap();
        let bktr = Bktr::new(&base, &patch).unwrap();
        assert_eq!(bktr.virtual_size(), VIRTUAL_SIZE);

        // Patch range: 0x100 bytes at virtual 0x5000 come from the
        // generation-2 region at physical 0x1000.
        let mut buf = vec![0u8; 0x100];
        bktr.read_virtual(0x5000, &mut buf).unwrap();
        assert_eq!(buf, &virtual_image[0x5000..0x5100]);

        // Original range: 0x100 bytes at virtual 0xC000 come from base
        // physical 0x8000.
        bktr.read_virtual(0xC000, &mut buf).unwrap();
        assert_eq!(buf, &virtual_image[0xC000..0xC100]);

        // Reads spanning entry boundaries split correctly.
        let mut spanning = vec![0u8; 0x2000];
        bktr.read_virtual(0x3000, &mut spanning).unwrap();
        assert_eq!(spanning, &virtual_image[0x3000..0x5000]);
    }

    #[test]
    fn test_full_coverage() {
        let virtual_image: Vec<u8> = (0..VIRTUAL_SIZE).map(|i| (i % 249) as u8).collect();
        let (base_image, patch_image, keyset) = build_pair(&virtual_image);

        let base = Nca::from_reader(Cursor::new(base_image), &keyset, None).unwrap();
        let patch = Nca::from_reader(Cursor::new(patch_image), &keyset, None).unwrap();
        let bktr = Bktr::new(&base, &patch).unwrap();

        let mut whole = vec![0u8; VIRTUAL_SIZE as usize];
        bktr.read_virtual(0, &mut whole).unwrap();
        assert_eq!(whole, virtual_image);
    }

    #[test]
    fn test_patched_romfs_and_update_detection() {
        let virtual_image = romfs_virtual_image();
        let (base_image, patch_image, keyset) = build_pair(&virtual_image);

        let base = Nca::from_reader(Cursor::new(base_image), &keyset, None).unwrap();
        let patch = Nca::from_reader(Cursor::new(patch_image), &keyset, None).unwrap();
        let bktr = Bktr::new(&base, &patch).unwrap();

        let mut romfs = bktr.open_romfs().unwrap();
        assert_eq!(romfs.extract_file("/small.bin").unwrap(), vec![0x11u8; 0x100]);
        assert_eq!(romfs.extract_file("/big.bin").unwrap(), vec![0x42u8; 0x6000]);

        let small = romfs.find_file("/small.bin").unwrap();
        let big = romfs.find_file("/big.bin").unwrap();
        assert!(!bktr.is_file_entry_updated(&romfs, &small).unwrap());
        assert!(bktr.is_file_entry_updated(&romfs, &big).unwrap());
    }

    #[test]
    fn test_mismatched_pair_rejected() {
        let virtual_image: Vec<u8> = vec![0; VIRTUAL_SIZE as usize];
        let (base_image, patch_image, keyset) = build_pair(&virtual_image);

        let base = Nca::from_reader(Cursor::new(base_image), &keyset, None).unwrap();
        let mut patch = Nca::from_reader(Cursor::new(patch_image), &keyset, None).unwrap();
        patch.header.program_id ^= 1;
        assert!(matches!(Bktr::new(&base, &patch), Err(Error::InvalidNca(_))));
    }
}
