//! NCA (Nintendo Content Archive) container
//!
//! An NCA file consists of:
//! - An encrypted header block (first 0xC00 bytes)
//!   - Main NCA header (0x400 bytes)
//!   - Section headers (0x200 bytes per section, up to 4 sections)
//! - Content sections containing filesystem data
//!
//! The header block is encrypted with AES-XTS using Nintendo's big-endian
//! sector tweak; content sections use AES-CTR (or AES-CTR-Ex for patch
//! sections), keyed either from the decrypted key area or from a titlekey
//! selected by the rights ID.
//!
//! Beyond parsing, this module carries the dump pipeline's patch mechanism:
//! a small set of header mutations plus hash-layer patches registered by
//! payload rewriters (CNMT, NACP). [`Nca::patch_stream_chunk`] overwrites
//! the affected bytes while an encrypted NCA streams through the NSP
//! builder, without ever materialising the whole archive.

use binrw::prelude::*;
use sha2::{Digest, Sha256};
use std::io::{Read, Result as IoResult, Seek, SeekFrom};
use tracing::instrument;

mod keys;
pub mod patch;
mod types;

pub use keys::NcaKeyManagement;
pub use types::*;

use crate::error::Error;
use crate::io::{SharedReader, apply_aes_ctr, apply_aes_ctr_ex, align_down, align_up, get_nintendo_tweak};
use crate::keys::{Keyset, TitleKeys};
use crate::formats::pfs0::Pfs0;
use crate::formats::romfs::RomFs;

/// Size of the encrypted NCA header block (main header + 4 section headers).
pub const NCA_FULL_HEADER_SIZE: usize = 0xC00;
/// Size of the serialised main header fields (the rest of 0x400 is padding).
pub const NCA_MAIN_HEADER_SIZE: usize = 0x340;
/// One NCA FS section header.
pub const NCA_FS_HEADER_SIZE: usize = 0x200;
/// XTS sector size used by the header block.
pub const NCA_SECTOR_SIZE: usize = 0x200;
/// Media block granularity of section offsets.
pub const NCA_MEDIA_BLOCK_SIZE: u64 = 0x200;
/// Maximum number of FS sections per NCA.
pub const NCA_SECTION_COUNT: usize = 4;

/// Represents the version byte of an NCA magic ("NCA0"/"NCA2"/"NCA3").
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcaVersion(pub u8);

impl NcaVersion {
    pub fn from_char(c: char) -> Self {
        Self(c as u8)
    }

    pub fn as_char(&self) -> char {
        self.0 as char
    }
}

/// Calculates the byte offset for a media block offset
pub fn get_block_offset(offset: u64) -> u64 {
    NCA_MEDIA_BLOCK_SIZE * offset
}

/// NCA main header, the first 0x340 bytes of the decrypted header block.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NcaHeader {
    #[brw(pad_size_to = 0x100)]
    pub header_sig: RSASignature,
    #[brw(pad_size_to = 0x100)]
    pub header_key_sig: RSASignature,
    #[brw(magic = b"NCA")]
    /// NCA version, extracted from the last byte of the magic.
    pub nca_version: NcaVersion,
    pub distribution: DistributionType,
    pub content_type: ContentType,
    pub key_generation_old: KeyGenerationOld,
    pub key_area_appkey_index: KeyAreaEncryptionKeyIndex,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    pub signature_key_generation: u8,
    pub _reserved_e: [u8; 0xE],
    pub rights_id: [u8; 0x10],
    #[br(count = 4)]
    #[brw(pad_size_to = 0x40)]
    pub fs_entries: Vec<FsEntry>,
    /// SHA-256 of each 0x200-byte FS section header.
    #[br(count = 4)]
    #[brw(pad_size_to = 0x80)]
    pub fs_header_hashes: Vec<[u8; 0x20]>,
    #[brw(pad_size_to = 0x40)]
    pub encrypted_keys: KeyArea,
}

impl NcaHeader {
    /// Parses an NCA header from an already-decrypted 0x340-byte slice.
    pub fn from_bytes(bytes: &[u8; NCA_MAIN_HEADER_SIZE]) -> Result<Self, Error> {
        let header: NcaHeader = binrw::io::Cursor::new(bytes).read_le()?;
        Ok(header)
    }

    /// Serializes the header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.write_le(&mut cursor)
            .expect("Failed to serialize header");
        cursor.into_inner()
    }

    /// Get the key generation to use (accounting for the old field)
    pub fn get_key_generation(&self) -> u8 {
        let key_gen_old = self.key_generation_old as u8;
        let key_gen = self.key_generation;

        let base_key_gen = key_gen_old.max(key_gen);

        // Both 0 and 1 are master key 0
        base_key_gen.saturating_sub(1)
    }

    pub fn has_rights_id(&self) -> bool {
        !self.rights_id.iter().all(|&b| b == 0)
    }
}

/// One enabled FS section of an NCA.
#[derive(Debug, Clone)]
pub struct NcaFsSection {
    /// Section index within the NCA (0..3).
    pub section_idx: usize,
    /// Content-absolute byte offset of the section.
    pub offset: u64,
    /// Byte size of the section.
    pub size: u64,
    pub header: FsHeader,
    pub section_type: NcaFsSectionType,
}

impl NcaFsSection {
    /// Section-relative offset and size of the plaintext data layer.
    pub fn data_layer(&self) -> (u64, u64) {
        match self.section_type {
            // NCA0-style sections have no hash tree; the whole section is data.
            NcaFsSectionType::Nca0RomFs => (0, self.size),
            _ => {
                let (offset, size) = self.header.hash_data.data_layer();
                if size == 0 { (0, self.size) } else { (offset, size) }
            }
        }
    }

    fn classify(version: NcaVersion, header: &FsHeader) -> NcaFsSectionType {
        if version.as_char() == '0' {
            return NcaFsSectionType::Nca0RomFs;
        }
        match header.fs_type {
            FsType::PartitionFs => NcaFsSectionType::PartitionFs,
            FsType::RomFs => {
                if header.encryption_type.is_ctr_ex() || header.patch_info.is_present() {
                    NcaFsSectionType::PatchRomFs
                } else {
                    NcaFsSectionType::RomFs
                }
            }
        }
    }
}

/// A pending byte-range overwrite against the encrypted content stream.
///
/// `data` is ciphertext, ready to be copied over any stream window that
/// intersects `offset`. Applying a patch twice is a no-op by construction.
#[derive(Debug, Clone)]
pub struct NcaRegionPatch {
    /// Content-absolute byte offset.
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Nca<R: Read + Seek> {
    reader: SharedReader<R>,
    /// Content ID from the parent CNMT record (zero for standalone opens).
    pub content_id: [u8; 0x10],
    pub content_size: u64,
    pub id_offset: u8,
    pub header: NcaHeader,
    /// Decrypted 0xC00 header block; mutations are re-serialised into it.
    raw_header: Vec<u8>,
    pub fs_sections: Vec<NcaFsSection>,
    key_mgmt: NcaKeyManagement,
    header_key: [u8; 0x20],
    /// Set once any mutation touched the header block.
    header_dirty: bool,
    /// Re-encrypted header block, built lazily on the first stream patch.
    encrypted_header_cache: Option<Vec<u8>>,
    /// True once a stream window fully covered the header block.
    pub header_written: bool,
    region_patches: Vec<NcaRegionPatch>,
}

impl<R: Read + Seek> Nca<R> {
    #[instrument(level = "trace", skip(reader, keyset, title_keys), fields(content_type, nca_version))]
    pub fn from_reader(
        reader: R,
        keyset: &Keyset,
        title_keys: Option<&TitleKeys>,
    ) -> Result<Self, Error> {
        let mut reader = reader;
        let content_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        if content_size < NCA_FULL_HEADER_SIZE as u64 {
            return Err(Error::InvalidNca("content smaller than header block".into()));
        }

        let mut encrypted_buf = vec![0; NCA_FULL_HEADER_SIZE];
        reader.read_exact(&mut encrypted_buf)?;

        let header_key = *keyset
            .header_key()
            .ok_or_else(|| Error::MissingKey("header_key".into()))?;

        let mut decrypted = encrypted_buf;
        decrypt_header_block(&mut decrypted, &header_key);

        let magic = &decrypted[0x200..0x204];
        if &magic[..3] != b"NCA" || !matches!(magic[3], b'0' | b'2' | b'3') {
            return Err(Error::InvalidNca(format!(
                "unrecognised magic {:02X?}",
                magic
            )));
        }
        let version = NcaVersion(magic[3]);

        // NCA2 encrypts each section header as its own sector 0; undo the
        // NCA3 assumption for the section header area.
        if version.as_char() == '2' {
            let xts = header_crypt(&header_key);
            for sect in 0..NCA_SECTION_COUNT {
                let start = 0x400 + sect * NCA_FS_HEADER_SIZE;
                // Re-encrypt with the NCA3 tweak, then decrypt as sector 0.
                xts.encrypt_area(
                    &mut decrypted[start..start + NCA_FS_HEADER_SIZE],
                    NCA_SECTOR_SIZE,
                    (start / NCA_SECTOR_SIZE) as u128,
                    get_nintendo_tweak,
                );
                xts.decrypt_area(
                    &mut decrypted[start..start + NCA_FS_HEADER_SIZE],
                    NCA_SECTOR_SIZE,
                    0,
                    get_nintendo_tweak,
                );
            }
        }

        let header = NcaHeader::from_bytes(
            decrypted[..NCA_MAIN_HEADER_SIZE]
                .try_into()
                .expect("slice length matches"),
        )?;

        tracing::Span::current()
            .record("content_type", format!("{:?}", header.content_type))
            .record("nca_version", format!("{}", header.nca_version.as_char()));

        // Parse and verify the filesystem headers for every enabled section.
        let mut fs_sections = Vec::new();
        for (i, entry) in header.fs_entries.iter().enumerate() {
            if !entry.is_enabled() {
                continue;
            }

            let fs_header_offset = 0x400 + (i * NCA_FS_HEADER_SIZE);
            let fs_header_data = &decrypted[fs_header_offset..fs_header_offset + NCA_FS_HEADER_SIZE];

            let actual = Sha256::digest(fs_header_data);
            if actual.as_slice() != header.fs_header_hashes[i] {
                return Err(Error::CorruptNca(format!(
                    "FS header {} hash mismatch",
                    i
                )));
            }

            let mut cursor = binrw::io::Cursor::new(fs_header_data);
            let fs_header: FsHeader = cursor.read_le()?;

            let offset = get_block_offset(entry.start_offset as u64);
            let size = get_block_offset((entry.end_offset - entry.start_offset) as u64);
            if offset + size > content_size {
                return Err(Error::InvalidNca(format!(
                    "section {} exceeds content size",
                    i
                )));
            }

            let section_type = NcaFsSection::classify(version, &fs_header);

            tracing::trace!(
                index = i,
                fs_type = ?fs_header.fs_type,
                encryption_type = ?fs_header.encryption_type,
                hash_type = ?fs_header.hash_type,
                section_type = ?section_type,
                "FS section decoded"
            );

            fs_sections.push(NcaFsSection {
                section_idx: i,
                offset,
                size,
                header: fs_header,
                section_type,
            });
        }

        let key_mgmt = NcaKeyManagement::new(&header, keyset, title_keys)?;

        Ok(Self {
            reader: SharedReader::new(reader),
            content_id: [0; 0x10],
            content_size,
            id_offset: 0,
            header,
            raw_header: decrypted,
            fs_sections,
            key_mgmt,
            header_key,
            header_dirty: false,
            encrypted_header_cache: None,
            header_written: false,
            region_patches: Vec::new(),
        })
    }

    /// Attaches the CNMT-declared identity of this content.
    pub fn set_content_info(&mut self, content_id: [u8; 0x10], id_offset: u8) {
        self.content_id = content_id;
        self.id_offset = id_offset;
    }

    #[inline]
    pub fn filesystem_count(&self) -> usize {
        self.fs_sections.len()
    }

    #[inline]
    pub fn has_rights_id(&self) -> bool {
        self.header.has_rights_id()
    }

    #[inline]
    pub fn has_valid_keys(&self) -> bool {
        self.key_mgmt.has_valid_keys()
    }

    pub fn titlekey(&self) -> Option<[u8; 0x10]> {
        self.key_mgmt.titlekey()
    }

    pub fn section(&self, section_idx: usize) -> Result<&NcaFsSection, Error> {
        self.fs_sections
            .iter()
            .find(|s| s.section_idx == section_idx)
            .ok_or_else(|| Error::InvalidState(format!("no FS section {}", section_idx)))
    }

    fn section_checked(&self, section_idx: usize) -> Result<&NcaFsSection, Error> {
        let section = self.section(section_idx)?;
        if section.header.has_sparse_layer() {
            return Err(Error::UnsupportedNca("sparse layer without decoder".into()));
        }
        if section.header.has_compression_layer() {
            return Err(Error::UnsupportedNca(
                "compression layer without decoder".into(),
            ));
        }
        if section.section_type == NcaFsSectionType::Nca0RomFs {
            return Err(Error::UnsupportedNca("NCA0 section reads".into()));
        }
        Ok(section)
    }

    fn section_key(&self, section: &NcaFsSection) -> Result<Option<[u8; 0x10]>, Error> {
        match section.header.encryption_type {
            EncryptionType::None => Ok(None),
            t if t.is_ctr() || t.is_ctr_ex() => Ok(Some(
                self.key_mgmt.get_aes_ctr_decrypt_key(&self.header.rights_id)?,
            )),
            EncryptionType::AesXts => Err(Error::UnsupportedNca("XTS section reads".into())),
            t => Err(Error::UnsupportedNca(format!(
                "encryption type {:?}",
                t
            ))),
        }
    }

    /// Reads plaintext section data. `offset` is section-relative and spans
    /// the whole section including hash layers.
    pub fn read_section(&self, section_idx: usize, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.read_section_inner(section_idx, offset, buf, None)
    }

    /// AES-CTR-Ex read with a caller-supplied generation counter; only used
    /// by the patched-RomFS overlay.
    pub fn read_section_ctr_ex(
        &self,
        section_idx: usize,
        offset: u64,
        buf: &mut [u8],
        generation: u32,
    ) -> Result<(), Error> {
        self.read_section_inner(section_idx, offset, buf, Some(generation))
    }

    fn read_section_inner(
        &self,
        section_idx: usize,
        offset: u64,
        buf: &mut [u8],
        generation: Option<u32>,
    ) -> Result<(), Error> {
        let section = self.section_checked(section_idx)?;

        if offset + buf.len() as u64 > section.size {
            return Err(Error::InvalidArgument(format!(
                "read past section end: {:#x}+{:#x} > {:#x}",
                offset,
                buf.len(),
                section.size
            )));
        }

        let key = self.section_key(section)?;
        let abs = section.offset + offset;

        let Some(key) = key else {
            self.reader.read_exact_at(abs, buf)?;
            return Ok(());
        };

        // Read the enclosing AES-block-aligned window, decrypt, slice out.
        let aligned_start = align_down(abs, 0x10);
        let aligned_end = align_up(abs + buf.len() as u64, 0x10);
        let mut window = vec![0u8; (aligned_end - aligned_start) as usize];
        self.reader.read_exact_at(aligned_start, &mut window)?;

        match generation {
            Some(generation) => apply_aes_ctr_ex(
                &key,
                section.header.ctr,
                generation,
                aligned_start,
                &mut window,
            ),
            None => apply_aes_ctr(&key, section.header.ctr, aligned_start, &mut window),
        }

        let skip = (abs - aligned_start) as usize;
        buf.copy_from_slice(&window[skip..skip + buf.len()]);
        Ok(())
    }

    /// Writes plaintext into the encrypted content image, producing the
    /// ciphertext that belongs at the given content-absolute offset.
    ///
    /// Only AES-CTR sections support this (the keystream is position-fixed,
    /// so re-encryption is the same operation as decryption).
    fn encrypt_section_bytes(
        &self,
        section_idx: usize,
        section_offset: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let section = self.section_checked(section_idx)?;
        if !section.header.encryption_type.is_ctr()
            && section.header.encryption_type != EncryptionType::None
        {
            return Err(Error::UnsupportedNca(
                "cannot re-encrypt non-CTR section data".into(),
            ));
        }

        let abs = section.offset + section_offset;

        let mut data = plaintext.to_vec();
        if section.header.encryption_type.is_ctr() {
            let key = self
                .section_key(section)?
                .expect("CTR section always has a key");
            // The keystream is position-fixed, so an unaligned overwrite is
            // handled by padding down to the AES block and slicing it off.
            let aligned_start = align_down(abs, 0x10);
            let pad = (abs - aligned_start) as usize;
            let mut window = vec![0u8; pad + data.len()];
            window[pad..].copy_from_slice(&data);
            apply_aes_ctr(&key, section.header.ctr, aligned_start, &mut window);
            data.copy_from_slice(&window[pad..]);
        }
        Ok(data)
    }

    /// Opens a Read + Seek view over a section's plaintext data layer.
    pub fn open_section_data(&self, section_idx: usize) -> Result<NcaSectionCursor<'_, R>, Error> {
        let section = self.section_checked(section_idx)?;
        let (data_offset, data_size) = section.data_layer();
        Ok(NcaSectionCursor {
            nca: self,
            section_idx,
            start: data_offset,
            size: data_size,
            position: 0,
        })
    }

    /// Opens a Read + Seek view over the full plaintext section (hash
    /// layers included).
    pub fn open_section_raw(&self, section_idx: usize) -> Result<NcaSectionCursor<'_, R>, Error> {
        let section = self.section_checked(section_idx)?;
        Ok(NcaSectionCursor {
            nca: self,
            section_idx,
            start: 0,
            size: section.size,
            position: 0,
        })
    }

    #[instrument(level = "trace", skip(self))]
    pub fn open_pfs0_filesystem(
        &self,
        section_idx: usize,
    ) -> Result<Pfs0<NcaSectionCursor<'_, R>>, Error> {
        let section = self.section(section_idx)?;
        if section.section_type != NcaFsSectionType::PartitionFs {
            return Err(Error::InvalidState(format!(
                "section {} is {:?}, not a partition FS",
                section_idx, section.section_type
            )));
        }
        Pfs0::from_reader(self.open_section_data(section_idx)?)
    }

    #[instrument(level = "trace", skip(self))]
    pub fn open_romfs_filesystem(
        &self,
        section_idx: usize,
    ) -> Result<RomFs<NcaSectionCursor<'_, R>>, Error> {
        let section = self.section(section_idx)?;
        if section.section_type != NcaFsSectionType::RomFs {
            return Err(Error::InvalidState(format!(
                "section {} is {:?}, not a RomFS",
                section_idx, section.section_type
            )));
        }
        RomFs::from_reader(self.open_section_data(section_idx)?)
    }

    /// Finds the first section of the given derived type.
    pub fn find_section(&self, section_type: NcaFsSectionType) -> Option<&NcaFsSection> {
        self.fs_sections
            .iter()
            .find(|s| s.section_type == section_type)
    }

    /// A raw view over the encrypted content image, as stored.
    pub fn content_reader(&self) -> crate::io::SubFile<SharedReader<R>> {
        self.reader.sub_file(0, self.content_size)
    }

    /// Reads raw encrypted content bytes (header block included).
    pub fn read_content_file(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if offset + buf.len() as u64 > self.content_size {
            return Err(Error::InvalidArgument("read past content end".into()));
        }
        self.reader.read_exact_at(offset, buf)?;
        Ok(())
    }

    // --- Mutations -------------------------------------------------------

    /// Forces the distribution type to Download.
    pub fn set_distribution_type_download(&mut self) {
        if self.header.distribution == DistributionType::Download {
            return;
        }
        self.header.distribution = DistributionType::Download;
        self.mark_header_dirty();
        tracing::trace!("distribution type rewritten to Download");
    }

    /// Clears the rights ID and stores the titlekey in the key area,
    /// re-wrapped under the key-area key, so the emitted NCA decrypts
    /// without a ticket.
    pub fn remove_titlekey_crypto(&mut self, keyset: &Keyset) -> Result<(), Error> {
        if !self.has_rights_id() {
            return Ok(());
        }

        let titlekey = self.key_mgmt.titlekey().ok_or_else(|| {
            Error::MissingKey("titlekey required to remove titlekey crypto".into())
        })?;

        let key_gen = self.header.get_key_generation();
        let kaek = match self.header.key_area_appkey_index {
            KeyAreaEncryptionKeyIndex::Application => {
                keyset.get_key_area_key_application(key_gen as usize)
            }
            KeyAreaEncryptionKeyIndex::Ocean => keyset.get_key_area_key_ocean(key_gen as usize),
            KeyAreaEncryptionKeyIndex::System => keyset.get_key_area_key_system(key_gen as usize),
        }
        .ok_or_else(|| Error::MissingKey(format!("key area key generation {}", key_gen)))?;

        self.header.rights_id = [0; 0x10];
        self.header.encrypted_keys.aes_ctr_key =
            crate::keys::title_keys::encrypt_titlekey_block(&titlekey, &kaek);
        self.mark_header_dirty();
        tracing::trace!("titlekey crypto removed");
        Ok(())
    }

    /// Registers a plaintext overwrite of section data as a pending
    /// encrypted stream patch.
    pub fn register_section_patch(
        &mut self,
        section_idx: usize,
        section_offset: u64,
        plaintext: &[u8],
    ) -> Result<(), Error> {
        let data = self.encrypt_section_bytes(section_idx, section_offset, plaintext)?;
        let abs = self.section(section_idx)?.offset + section_offset;
        self.region_patches.push(NcaRegionPatch { offset: abs, data });
        Ok(())
    }

    /// True if any mutation is pending on this NCA.
    pub fn is_dirty(&self) -> bool {
        self.header_dirty || !self.region_patches.is_empty()
    }

    pub fn region_patches(&self) -> &[NcaRegionPatch] {
        &self.region_patches
    }

    fn mark_header_dirty(&mut self) {
        self.header_dirty = true;
        self.encrypted_header_cache = None;
    }

    /// Re-serialises the (possibly mutated) main header into the decrypted
    /// header block and refreshes the FS-header hash for `section_idx`.
    pub(crate) fn resync_raw_header(&mut self, section_idx: Option<usize>) {
        if let Some(idx) = section_idx {
            if let Some(section) = self
                .fs_sections
                .iter()
                .find(|s| s.section_idx == idx)
            {
                let mut cursor = binrw::io::Cursor::new(Vec::new());
                section
                    .header
                    .write_le(&mut cursor)
                    .expect("FS header serialises");
                let bytes = cursor.into_inner();
                let start = 0x400 + idx * NCA_FS_HEADER_SIZE;
                self.raw_header[start..start + NCA_FS_HEADER_SIZE].copy_from_slice(&bytes);
                self.header.fs_header_hashes[idx] = Sha256::digest(&bytes).into();
            }
        }

        let main = self.header.to_bytes();
        self.raw_header[..NCA_MAIN_HEADER_SIZE].copy_from_slice(&main);
        self.mark_header_dirty();
    }

    /// Overwrites any bytes of `buf` (a window of the encrypted content
    /// stream starting at `window_offset`) that belong to the mutated
    /// header block or to a registered patch. Idempotent across repeated
    /// or overlapping windows.
    pub fn patch_stream_chunk(&mut self, window_offset: u64, buf: &mut [u8]) {
        if self.header_dirty {
            if self.encrypted_header_cache.is_none() {
                self.resync_header_block();
            }
            let header = self
                .encrypted_header_cache
                .as_ref()
                .expect("cache built above")
                .clone();
            let covered_end =
                overlay_bytes(window_offset, buf, 0, &header);
            if covered_end >= NCA_FULL_HEADER_SIZE as u64 {
                self.header_written = true;
            }
        }

        for patch in &self.region_patches {
            overlay_bytes(window_offset, buf, patch.offset, &patch.data);
        }
    }

    fn resync_header_block(&mut self) {
        // Main header may have pending struct-level mutations.
        let main = self.header.to_bytes();
        self.raw_header[..NCA_MAIN_HEADER_SIZE].copy_from_slice(&main);

        let mut encrypted = self.raw_header.clone();
        encrypt_header_block(&mut encrypted, &self.header_key);
        self.encrypted_header_cache = Some(encrypted);
    }

    /// The decrypted header block as it would be emitted (for tests and
    /// the meta NCA rewrite path).
    pub fn raw_header(&self) -> &[u8] {
        &self.raw_header
    }
}

/// Read + Seek view over one section's plaintext bytes.
pub struct NcaSectionCursor<'a, R: Read + Seek> {
    nca: &'a Nca<R>,
    section_idx: usize,
    start: u64,
    size: u64,
    position: u64,
}

impl<R: Read + Seek> NcaSectionCursor<'_, R> {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: Read + Seek> Read for NcaSectionCursor<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len() as u64, self.size - self.position) as usize;
        self.nca
            .read_section(self.section_idx, self.start + self.position, &mut buf[..n])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for NcaSectionCursor<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.size as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_pos < 0 || new_pos as u64 > self.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek out of section bounds",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// Copies the overlap of `data` (placed at `data_offset` in the content
/// image) over `buf` (a stream window at `window_offset`). Returns the
/// content-absolute end of the window for header-completion tracking.
fn overlay_bytes(window_offset: u64, buf: &mut [u8], data_offset: u64, data: &[u8]) -> u64 {
    let window_end = window_offset + buf.len() as u64;
    let data_end = data_offset + data.len() as u64;

    let start = window_offset.max(data_offset);
    let end = window_end.min(data_end);
    if start < end {
        let src = (start - data_offset) as usize..(end - data_offset) as usize;
        let dst = (start - window_offset) as usize..(end - window_offset) as usize;
        buf[dst].copy_from_slice(&data[src]);
    }
    window_end
}

fn header_crypt(header_key: &[u8; 0x20]) -> xts_mode::Xts128<aes::Aes128> {
    use cipher::KeyInit;
    use cipher::generic_array::GenericArray;
    let cipher_1 = aes::Aes128::new(GenericArray::from_slice(&header_key[..0x10]));
    let cipher_2 = aes::Aes128::new(GenericArray::from_slice(&header_key[0x10..]));
    xts_mode::Xts128::new(cipher_1, cipher_2)
}

/// Decrypts the 0xC00-byte header block in place (NCA3 layout).
pub fn decrypt_header_block(block: &mut [u8], header_key: &[u8; 0x20]) {
    header_crypt(header_key).decrypt_area(block, NCA_SECTOR_SIZE, 0, get_nintendo_tweak);
}

/// Encrypts the 0xC00-byte header block in place (NCA3 layout).
pub fn encrypt_header_block(block: &mut [u8], header_key: &[u8; 0x20]) {
    header_crypt(header_key).encrypt_area(block, NCA_SECTOR_SIZE, 0, get_nintendo_tweak);
}

#[cfg(test)]
pub(crate) mod test_fixtures;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::nca::test_fixtures::*;

    #[test]
    fn test_header_round_trip() {
        let header = test_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), NCA_MAIN_HEADER_SIZE);
        assert_eq!(&bytes[0x200..0x204], b"NCA3");

        let parsed = NcaHeader::from_bytes(bytes.as_slice().try_into().unwrap()).unwrap();
        assert_eq!(parsed.content_type, header.content_type);
        assert_eq!(parsed.rights_id, header.rights_id);
    }

    #[test]
    fn test_header_block_enc_dec() {
        let key = [7u8; 0x20];
        let mut block = vec![0u8; NCA_FULL_HEADER_SIZE];
        block[..NCA_MAIN_HEADER_SIZE].copy_from_slice(&test_header().to_bytes());
        let reference = block.clone();

        encrypt_header_block(&mut block, &key);
        assert_ne!(block, reference);
        decrypt_header_block(&mut block, &key);
        assert_eq!(block, reference);
    }

    #[test]
    fn test_open_synthetic_nca_and_read_section() {
        let (image, keyset, plain_body) = build_plain_ctr_nca(ContentType::Data, 0x800);
        let nca = Nca::from_reader(std::io::Cursor::new(image), &keyset, None).unwrap();

        assert_eq!(nca.filesystem_count(), 1);
        let section = &nca.fs_sections[0];
        assert_eq!(section.section_type, NcaFsSectionType::RomFs);

        let mut buf = vec![0u8; plain_body.len()];
        nca.read_section(0, 0, &mut buf).unwrap();
        assert_eq!(buf, plain_body);

        // Unaligned read inside the section.
        let mut small = [0u8; 7];
        nca.read_section(0, 0x33, &mut small).unwrap();
        assert_eq!(&small[..], &plain_body[0x33..0x3A]);
    }

    #[test]
    fn test_corrupt_fs_header_hash_detected() {
        let (mut image, keyset, _) = build_plain_ctr_nca(ContentType::Data, 0x400);

        // Flip one bit in the encrypted FS header area.
        image[0x400] ^= 1;
        let err = Nca::from_reader(std::io::Cursor::new(image), &keyset, None).unwrap_err();
        assert!(matches!(err, Error::CorruptNca(_)));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let keyset = test_keyset();
        let image = vec![0u8; NCA_FULL_HEADER_SIZE + 0x200];
        let err = Nca::from_reader(std::io::Cursor::new(image), &keyset, None).unwrap_err();
        assert!(matches!(err, Error::InvalidNca(_)));
    }

    #[test]
    fn test_distribution_mutation_patches_stream() {
        let (image, keyset, _) = build_plain_ctr_nca(ContentType::Data, 0x400);
        let mut nca = Nca::from_reader(std::io::Cursor::new(image.clone()), &keyset, None).unwrap();
        assert_eq!(nca.header.distribution, DistributionType::GameCard);

        nca.set_distribution_type_download();
        assert!(nca.is_dirty());

        // Stream the whole image through the patcher in two windows.
        let mut out = image.clone();
        let split = 0x700;
        let (a, b) = out.split_at_mut(split);
        nca.patch_stream_chunk(0, a);
        nca.patch_stream_chunk(split as u64, b);
        assert!(nca.header_written);

        // The patched stream must decrypt to a Download-type header.
        let mut header_block = out[..NCA_FULL_HEADER_SIZE].to_vec();
        decrypt_header_block(&mut header_block, keyset.header_key().unwrap());
        assert_eq!(header_block[0x204], DistributionType::Download as u8);

        // Body bytes are untouched.
        assert_eq!(&out[NCA_FULL_HEADER_SIZE..], &image[NCA_FULL_HEADER_SIZE..]);
    }

    #[test]
    fn test_patch_stream_chunk_idempotent() {
        let (image, keyset, _) = build_plain_ctr_nca(ContentType::Data, 0x400);
        let mut nca = Nca::from_reader(std::io::Cursor::new(image.clone()), &keyset, None).unwrap();
        nca.set_distribution_type_download();

        let mut once = image.clone();
        nca.patch_stream_chunk(0, &mut once);
        let mut twice = once.clone();
        nca.patch_stream_chunk(0, &mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_section_patch_round_trips_through_decrypt() {
        let (image, keyset, plain_body) = build_plain_ctr_nca(ContentType::Data, 0x800);
        let mut nca = Nca::from_reader(std::io::Cursor::new(image.clone()), &keyset, None).unwrap();

        let replacement = vec![0xEEu8; 0x20];
        nca.register_section_patch(0, 0x40, &replacement).unwrap();

        let mut out = image.clone();
        nca.patch_stream_chunk(0, &mut out);

        // Re-open the patched image; the plaintext must carry the overwrite.
        let nca2 = Nca::from_reader(std::io::Cursor::new(out), &keyset, None).unwrap();
        let mut body = vec![0u8; plain_body.len()];
        nca2.read_section(0, 0, &mut body).unwrap();
        assert_eq!(&body[0x40..0x60], &replacement[..]);
        assert_eq!(&body[..0x40], &plain_body[..0x40]);
        assert_eq!(&body[0x60..], &plain_body[0x60..]);
    }
}
