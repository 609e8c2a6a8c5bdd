//! Content Meta (CNMT) parsing and rewriting.
//!
//! A Meta NCA's first section is a single-entry PFS whose one file,
//! `<Type>_<titleid>.cnmt`, binds a title to its content set: per-content
//! IDs, sizes and SHA-256 hashes, sub-references for system updates, a
//! type-specific extended header and data block, and a trailing digest.
//!
//! The dump pipeline also rewrites CNMTs: when an NCA is mutated in-flight
//! its content record must be replaced with the new content ID and hash,
//! and the meta NCA itself then needs a hash-layer patch covering the
//! rewritten file (see [`Cnmt::generate_meta_nca_patch`]).

mod enums;
mod extended_header;

use binrw::prelude::*;
pub use enums::*;
pub use extended_header::*;
use std::io::{Read, Seek};

use crate::error::Error;
use crate::formats::nca::Nca;

/// Serialised size of [`CnmtHeader`].
pub const CNMT_HEADER_SIZE: usize = 0x20;
/// Size of the trailing digest.
pub const CNMT_DIGEST_SIZE: usize = 0x20;

/// Content Meta header structure
#[derive(Debug, Clone)]
#[binrw]
#[brw(little)]
pub struct CnmtHeader {
    /// Title ID
    pub title_id: u64,
    /// Title version
    pub title_version: u32,
    /// Content meta type
    pub meta_type: ContentMetaType,
    /// Platform for the content meta
    pub meta_platform: ContentMetaPlatform,
    /// Extended header size
    pub extended_header_size: u16,
    /// Number of content entries
    pub total_content_entries: u16,
    /// Number of meta entries
    pub total_content_meta_entries: u16,
    /// Content meta attributes
    pub attributes: u8,
    /// Storage ID
    pub storage_id: u8,
    /// Content install type
    pub content_install_type: u8,
    /// Reserved field
    pub _reserved: u8,
    /// Required system version for download
    pub required_dl_system_version: u32,
    pub _reserved2: u32,
}

/// Content info structure containing details about content files
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedContentInfo {
    /// Content ID
    pub content_id: [u8; 16],
    /// Size of the content in bytes (stored as a 48-bit value)
    #[br(map = |bytes: [u8; 6]| u64::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], 0, 0]))]
    #[bw(map = |&size: &u64| [size as u8, (size >> 8) as u8, (size >> 16) as u8, (size >> 24) as u8, (size >> 32) as u8, (size >> 40) as u8])]
    pub size: u64,
    /// Content type
    pub content_type: PackagedContentType,
    /// ID offset
    pub id_offset: u8,
}

/// Content entry with hash and info
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedContent {
    /// SHA-256 hash of the content
    pub hash: [u8; 32],
    /// Content info fields (without the hash)
    pub info: PackagedContentInfo,
}

/// Content type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum PackagedContentType {
    /// Meta content
    Meta = 0,
    /// Program content
    Program = 1,
    /// Data content
    Data = 2,
    /// Control content
    Control = 3,
    /// HTML document content
    HtmlDocument = 4,
    /// Legal information content
    LegalInformation = 5,
    /// Delta fragment content
    DeltaFragment = 6,
}

impl PackagedContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackagedContentType::Meta => "Meta",
            PackagedContentType::Program => "Program",
            PackagedContentType::Data => "Data",
            PackagedContentType::Control => "Control",
            PackagedContentType::HtmlDocument => "HtmlDocument",
            PackagedContentType::LegalInformation => "LegalInformation",
            PackagedContentType::DeltaFragment => "DeltaFragment",
        }
    }
}

/// Content meta entry for dependent content (SystemUpdate sub-references)
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct ContentMetaEntry {
    /// Title ID
    pub title_id: u64,
    /// Version
    pub version: u32,
    /// Meta type
    pub meta_type: u8,
    /// Attributes
    pub attributes: u8,
    /// Reserved field
    pub _reserved: u16,
}

/// Where a parsed CNMT lives inside its meta NCA.
#[derive(Debug, Clone)]
pub struct CnmtLocation {
    /// The `.cnmt` entry name inside the meta NCA's PFS section.
    pub file_name: String,
    /// Section index holding the PFS.
    pub section_idx: usize,
    /// Section-relative byte offset of the file content.
    pub section_offset: u64,
}

/// Main CNMT structure containing all parsed data
#[derive(Debug, Clone)]
pub struct Cnmt {
    /// CNMT header
    pub header: CnmtHeader,
    /// Extended header based on meta_type
    pub extended_header: ExtendedHeader,
    /// Content entries
    pub content_entries: Vec<PackagedContent>,
    /// Meta entries
    pub meta_entries: Vec<ContentMetaEntry>,
    /// Type-specific extended data block
    pub extended_data: Vec<u8>,
    /// Digest identifying the overall content set
    pub digest: [u8; CNMT_DIGEST_SIZE],
    /// Present when parsed out of a meta NCA.
    pub location: Option<CnmtLocation>,
}

impl Cnmt {
    /// Parse a CNMT from an in-memory blob.
    pub fn from_bytes(blob: &[u8]) -> Result<Self, Error> {
        if blob.len() < CNMT_HEADER_SIZE + CNMT_DIGEST_SIZE {
            return Err(Error::InvalidCnmt("blob shorter than header + digest".into()));
        }

        let mut reader = binrw::io::Cursor::new(blob);
        let header: CnmtHeader = reader.read_le()?;

        let extended_header =
            ExtendedHeader::parse(&mut reader, header.meta_type, header.extended_header_size)?;
        if extended_header.byte_size() != header.extended_header_size as usize {
            return Err(Error::InvalidCnmt(format!(
                "extended header size {:#x} does not match type {:?}",
                header.extended_header_size, header.meta_type
            )));
        }
        if header.meta_type.carries_extended_data() && extended_header.extended_data_size() == 0 {
            return Err(Error::InvalidCnmt(format!(
                "{:?} meta requires a non-empty extended data block",
                header.meta_type
            )));
        }

        let mut content_entries = Vec::with_capacity(header.total_content_entries as usize);
        for _ in 0..header.total_content_entries {
            let entry: PackagedContent = reader.read_le()?;
            content_entries.push(entry);
        }

        let mut meta_entries = Vec::with_capacity(header.total_content_meta_entries as usize);
        for _ in 0..header.total_content_meta_entries {
            let entry: ContentMetaEntry = reader.read_le()?;
            meta_entries.push(entry);
        }

        let consumed = reader.position() as usize;
        let remaining = blob.len() - consumed;
        let extended_data_size = extended_header.extended_data_size() as usize;
        if remaining < extended_data_size + CNMT_DIGEST_SIZE {
            return Err(Error::InvalidCnmt("extended data exceeds blob".into()));
        }
        let extended_data = blob[consumed..consumed + extended_data_size].to_vec();

        let digest_start = blob.len() - CNMT_DIGEST_SIZE;
        let digest: [u8; CNMT_DIGEST_SIZE] = blob[digest_start..].try_into().unwrap();

        Ok(Cnmt {
            header,
            extended_header,
            content_entries,
            meta_entries,
            extended_data,
            digest,
            location: None,
        })
    }

    /// Parse a CNMT file from a reader
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, Error> {
        let mut blob = Vec::new();
        reader.read_to_end(&mut blob)?;
        Self::from_bytes(&blob)
    }

    /// Parses the CNMT out of a meta NCA: its first section is a PFS with
    /// exactly one `<Type>_<titleid>.cnmt` entry, which must agree with
    /// the parsed header.
    pub fn from_meta_nca<R: Read + Seek>(nca: &Nca<R>) -> Result<Self, Error> {
        let section = nca
            .fs_sections
            .first()
            .ok_or_else(|| Error::InvalidCnmt("meta NCA has no FS sections".into()))?;
        let section_idx = section.section_idx;

        let mut pfs = nca.open_pfs0_filesystem(section_idx)?;
        if pfs.file_count() != 1 {
            return Err(Error::InvalidCnmt(format!(
                "meta NCA PFS holds {} entries, expected exactly one",
                pfs.file_count()
            )));
        }

        let file_name = pfs.get_entry(0).expect("entry checked").name.clone();
        let (name_type, name_title_id) = parse_cnmt_file_name(&file_name)?;

        let blob = pfs.read_file(&file_name)?;
        let mut cnmt = Self::from_bytes(&blob)?;

        if cnmt.header.title_id != name_title_id {
            return Err(Error::InvalidCnmt(format!(
                "file name title ID {:016X} disagrees with header {:016X}",
                name_title_id, cnmt.header.title_id
            )));
        }
        if cnmt.header.meta_type != name_type {
            return Err(Error::InvalidCnmt(format!(
                "file name type {:?} disagrees with header {:?}",
                name_type, cnmt.header.meta_type
            )));
        }

        let (data_layer_offset, _) = section.data_layer();
        let entry_offset = pfs
            .entry_image_offset(0)
            .expect("entry checked");
        cnmt.location = Some(CnmtLocation {
            file_name,
            section_idx,
            section_offset: data_layer_offset + entry_offset,
        });

        tracing::trace!(
            title_id = %cnmt.get_title_id_string(),
            meta_type = ?cnmt.header.meta_type,
            content_count = cnmt.content_entries.len(),
            "CNMT parsed from meta NCA"
        );

        Ok(cnmt)
    }

    /// Serialises the CNMT back to its on-disk layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.header.write_le(&mut cursor)?;
        self.extended_header.write_to(&mut cursor)?;
        for entry in &self.content_entries {
            entry.write_le(&mut cursor)?;
        }
        for entry in &self.meta_entries {
            entry.write_le(&mut cursor)?;
        }
        let mut out = cursor.into_inner();
        out.extend_from_slice(&self.extended_data);
        out.extend_from_slice(&self.digest);
        Ok(out)
    }

    pub fn get_title_id_string(&self) -> String {
        format!("{:016x}", self.header.title_id)
    }

    /// Get content entry by its type
    pub fn get_content_entry_by_type(
        &self,
        content_type: PackagedContentType,
    ) -> Option<&PackagedContent> {
        self.content_entries
            .iter()
            .find(|entry| entry.info.content_type == content_type)
    }

    /// Get the content ID of the main program
    pub fn get_main_content_id(&self) -> Option<[u8; 16]> {
        self.get_content_entry_by_type(PackagedContentType::Program)
            .map(|entry| entry.info.content_id)
    }

    /// Sum of all declared content sizes.
    pub fn total_content_size(&self) -> u64 {
        self.content_entries.iter().map(|e| e.info.size).sum()
    }

    /// Replaces the record matching `(content_type, id_offset)` with a new
    /// content ID, size and hash. Used right after a mutated NCA finished
    /// streaming.
    pub fn update_content_info(
        &mut self,
        content_type: PackagedContentType,
        id_offset: u8,
        new_content_id: [u8; 16],
        new_size: u64,
        new_hash: [u8; 32],
    ) -> Result<(), Error> {
        let entry = self
            .content_entries
            .iter_mut()
            .find(|e| e.info.content_type == content_type && e.info.id_offset == id_offset)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "content record ({:?}, id offset {})",
                    content_type, id_offset
                ))
            })?;

        entry.info.content_id = new_content_id;
        entry.info.size = new_size;
        entry.hash = new_hash;

        tracing::trace!(
            content_type = ?content_type,
            id_offset,
            new_content_id = %hex::encode(new_content_id),
            "CNMT content record updated"
        );
        Ok(())
    }

    /// Registers the rewritten CNMT body (and its hash-layer updates) as
    /// stream patches on the meta NCA. The rewritten blob must keep its
    /// original length.
    pub fn generate_meta_nca_patch<R: Read + Seek>(
        &self,
        meta_nca: &mut Nca<R>,
    ) -> Result<(), Error> {
        let location = self.location.as_ref().ok_or_else(|| {
            Error::InvalidState("CNMT was not parsed from a meta NCA".into())
        })?;

        let new_blob = self.to_bytes()?;
        crate::formats::nca::patch::generate_hash_data_patch(
            meta_nca,
            location.section_idx,
            location.section_offset,
            &new_blob,
        )
    }

    /// Emits the authoring-tool XML for this title. `contents` carries the
    /// final per-content identities (post-mutation), meta NCA included.
    pub fn generate_authoring_tool_xml(&self, contents: &[CnmtXmlContent]) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        xml.push_str("<ContentMeta>\n");
        xml.push_str(&format!("  <Type>{}</Type>\n", self.header.meta_type.as_str()));
        xml.push_str(&format!("  <Id>0x{:016x}</Id>\n", self.header.title_id));
        xml.push_str(&format!("  <Version>{}</Version>\n", self.header.title_version));
        xml.push_str(&format!(
            "  <RequiredDownloadSystemVersion>{}</RequiredDownloadSystemVersion>\n",
            self.header.required_dl_system_version
        ));

        for content in contents {
            xml.push_str("  <Content>\n");
            xml.push_str(&format!(
                "    <Type>{}</Type>\n",
                content.content_type.as_str()
            ));
            xml.push_str(&format!("    <Id>{}</Id>\n", hex::encode(content.content_id)));
            xml.push_str(&format!("    <Size>{}</Size>\n", content.size));
            xml.push_str(&format!("    <Hash>{}</Hash>\n", hex::encode(content.hash)));
            xml.push_str(&format!(
                "    <KeyGeneration>{}</KeyGeneration>\n",
                content.key_generation
            ));
            xml.push_str(&format!("    <IdOffset>{}</IdOffset>\n", content.id_offset));
            xml.push_str("  </Content>\n");
        }

        xml.push_str(&format!("  <Digest>{}</Digest>\n", hex::encode(self.digest)));
        xml.push_str(&format!(
            "  <KeyGenerationMin>{}</KeyGenerationMin>\n",
            contents.iter().map(|c| c.key_generation).min().unwrap_or(0)
        ));

        match &self.extended_header {
            ExtendedHeader::Application(h) => {
                xml.push_str(&format!(
                    "  <RequiredSystemVersion>{}</RequiredSystemVersion>\n",
                    h.required_system_version
                ));
                xml.push_str(&format!("  <PatchId>0x{:016x}</PatchId>\n", h.patch_id));
            }
            ExtendedHeader::Patch(h) => {
                xml.push_str(&format!(
                    "  <RequiredSystemVersion>{}</RequiredSystemVersion>\n",
                    h.required_system_version
                ));
                xml.push_str(&format!(
                    "  <ApplicationId>0x{:016x}</ApplicationId>\n",
                    h.application_id
                ));
            }
            ExtendedHeader::Addon(h) => {
                xml.push_str(&format!(
                    "  <RequiredApplicationVersion>{}</RequiredApplicationVersion>\n",
                    h.required_application_version
                ));
                xml.push_str(&format!(
                    "  <ApplicationId>0x{:016x}</ApplicationId>\n",
                    h.application_id
                ));
            }
            _ => {}
        }

        xml.push_str("</ContentMeta>\n");
        xml
    }
}

/// Per-content summary consumed by the authoring XML generator.
#[derive(Debug, Clone)]
pub struct CnmtXmlContent {
    pub content_type: PackagedContentType,
    pub content_id: [u8; 16],
    pub size: u64,
    pub hash: [u8; 32],
    pub key_generation: u8,
    pub id_offset: u8,
}

/// Splits `<Type>_<titleid>.cnmt` into its meta type and title ID.
fn parse_cnmt_file_name(name: &str) -> Result<(ContentMetaType, u64), Error> {
    let stem = name
        .strip_suffix(".cnmt")
        .ok_or_else(|| Error::InvalidCnmt(format!("'{}' is not a .cnmt entry", name)))?;
    let (type_str, title_id_str) = stem
        .rsplit_once('_')
        .ok_or_else(|| Error::InvalidCnmt(format!("malformed cnmt name '{}'", name)))?;

    let meta_type = ContentMetaType::from_name(type_str)
        .ok_or_else(|| Error::InvalidCnmt(format!("unknown meta type '{}'", type_str)))?;
    let title_id = u64::from_str_radix(title_id_str, 16)
        .map_err(|_| Error::InvalidCnmt(format!("bad title ID in '{}'", name)))?;

    Ok((meta_type, title_id))
}

/// Builds the canonical `.cnmt` file name for a title.
pub fn cnmt_file_name(meta_type: ContentMetaType, title_id: u64) -> String {
    format!("{}_{:016x}.cnmt", meta_type.as_str(), title_id)
}
