//! Extended header structures for Content Meta (CNMT) files.
//!
//! Each content meta type carries its own extended header with the fields
//! relevant to that type; `ExtendedHeader` is the common interface over
//! them.
use binrw::prelude::*;

use super::enums::ContentMetaType;

/// Extended header variants based on content meta type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedHeader {
    Application(ApplicationMetaExtendedHeader),
    Patch(PatchMetaExtendedHeader),
    Addon(AddonContentMetaExtendedHeader),
    Delta(DeltaMetaExtendedHeader),
    SystemUpdate(SystemUpdateMetaExtendedHeader),
    DataPatch(DataPatchMetaExtendedHeader),
    Unknown(Vec<u8>),
}

impl ExtendedHeader {
    /// Serialised byte size of this extended header.
    pub fn byte_size(&self) -> usize {
        match self {
            ExtendedHeader::Application(_) => 0x10,
            ExtendedHeader::Patch(_) => 0x18,
            ExtendedHeader::Addon(_) => 0x18,
            ExtendedHeader::Delta(_) => 0x10,
            ExtendedHeader::SystemUpdate(_) => 0x4,
            ExtendedHeader::DataPatch(_) => 0x18,
            ExtendedHeader::Unknown(raw) => raw.len(),
        }
    }

    /// Declared size of the trailing extended data block, if this type has
    /// one.
    pub fn extended_data_size(&self) -> u32 {
        match self {
            ExtendedHeader::Patch(h) => h.extended_data_size,
            ExtendedHeader::Delta(h) => h.extended_data_size,
            ExtendedHeader::SystemUpdate(h) => h.extended_data_size,
            ExtendedHeader::DataPatch(h) => h.extended_data_size,
            _ => 0,
        }
    }

    /// The related title this meta points at, for XML emission:
    /// patch id for applications, application id for patches/add-ons.
    pub fn related_title_id(&self) -> Option<(&'static str, u64)> {
        match self {
            ExtendedHeader::Application(h) => Some(("PatchId", h.patch_id)),
            ExtendedHeader::Patch(h) => Some(("ApplicationId", h.application_id)),
            ExtendedHeader::Addon(h) => Some(("ApplicationId", h.application_id)),
            ExtendedHeader::Delta(h) => Some(("ApplicationId", h.application_id)),
            ExtendedHeader::DataPatch(h) => Some(("ApplicationId", h.application_id)),
            _ => None,
        }
    }

    pub fn write_to(&self, cursor: &mut binrw::io::Cursor<Vec<u8>>) -> binrw::BinResult<()> {
        match self {
            ExtendedHeader::Application(h) => h.write_le(cursor),
            ExtendedHeader::Patch(h) => h.write_le(cursor),
            ExtendedHeader::Addon(h) => h.write_le(cursor),
            ExtendedHeader::Delta(h) => h.write_le(cursor),
            ExtendedHeader::SystemUpdate(h) => h.write_le(cursor),
            ExtendedHeader::DataPatch(h) => h.write_le(cursor),
            ExtendedHeader::Unknown(raw) => {
                use std::io::Write;
                cursor.write_all(raw).map_err(binrw::Error::from)
            }
        }
    }

    /// Parses the extended header matching `meta_type` from a reader.
    pub fn parse<R: std::io::Read + std::io::Seek>(
        reader: &mut R,
        meta_type: ContentMetaType,
        declared_size: u16,
    ) -> binrw::BinResult<Self> {
        Ok(match meta_type {
            ContentMetaType::Application => {
                ExtendedHeader::Application(reader.read_le()?)
            }
            ContentMetaType::Patch => ExtendedHeader::Patch(reader.read_le()?),
            ContentMetaType::AddOnContent => ExtendedHeader::Addon(reader.read_le()?),
            ContentMetaType::Delta => ExtendedHeader::Delta(reader.read_le()?),
            ContentMetaType::SystemUpdate => ExtendedHeader::SystemUpdate(reader.read_le()?),
            ContentMetaType::DataPatch => ExtendedHeader::DataPatch(reader.read_le()?),
            _ => {
                let mut unknown_data = vec![0; declared_size as usize];
                reader.read_exact(&mut unknown_data)?;
                ExtendedHeader::Unknown(unknown_data)
            }
        })
    }
}

/// Extended header for System Update type
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemUpdateMetaExtendedHeader {
    /// Data size
    pub extended_data_size: u32,
}

/// Extended header for Application type
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMetaExtendedHeader {
    /// Patch ID
    pub patch_id: u64,
    /// Minimum system version required
    pub required_system_version: u32,
    /// Required application version
    pub required_application_version: u32,
}

/// Extended header for Patch type
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMetaExtendedHeader {
    /// Application ID
    pub application_id: u64,
    /// Minimum system version required
    pub required_system_version: u32,
    /// Extended data size
    pub extended_data_size: u32,
    /// Reserved
    pub _reserved: u64,
}

/// Extended header for AddOn type
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonContentMetaExtendedHeader {
    /// Application ID
    pub application_id: u64,
    /// Minimum application version required
    pub required_application_version: u32,
    /// [15.0.0+] Content accessibilities
    pub content_accessibilities: u8,
    /// Reserved
    pub _reserved: [u8; 3],
    /// Data patch ID
    pub data_patch_id: u64,
}

/// Extended header for Delta type
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaMetaExtendedHeader {
    /// Application ID
    pub application_id: u64,
    /// Extended data size
    pub extended_data_size: u32,
    /// Reserved
    pub _reserved: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPatchMetaExtendedHeader {
    /// Application ID
    pub application_id: u64,
    /// Minimum application version required
    pub required_application_version: u32,
    pub extended_data_size: u32,
    pub _reserved: u64,
}
