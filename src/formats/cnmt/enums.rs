//! Content Meta (CNMT) enums.
//!
//! - `ContentMetaType`: the kinds of content meta (applications, patches,
//!   add-on content, system titles, deltas)
//! - `ContentMetaPlatform`: the platform a content meta targets
use binrw::prelude::*;

/// Content Meta Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum ContentMetaType {
    Invalid = 0x00,
    /// A system application (sysmodules, applets, etc)
    SystemProgram = 0x01,
    /// A system data archive
    SystemData = 0x02,
    /// A system update
    SystemUpdate = 0x03,
    /// A boot image package (firmware package A or C)
    BootImagePackage = 0x04,
    /// A boot image package, safe mode (firmware package B or D)
    BootImagePackageSafe = 0x05,
    /// An application
    Application = 0x80,
    /// A patch
    Patch = 0x81,
    /// An add-on
    AddOnContent = 0x82,
    /// A delta fragment
    Delta = 0x83,
    /// [15.0.0+] A data patch
    DataPatch = 0x84,
}

impl ContentMetaType {
    /// Canonical name used in `.cnmt` filenames and authoring XML.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentMetaType::Invalid => "Invalid",
            ContentMetaType::SystemProgram => "SystemProgram",
            ContentMetaType::SystemData => "SystemData",
            ContentMetaType::SystemUpdate => "SystemUpdate",
            ContentMetaType::BootImagePackage => "BootImagePackage",
            ContentMetaType::BootImagePackageSafe => "BootImagePackageSafe",
            ContentMetaType::Application => "Application",
            ContentMetaType::Patch => "Patch",
            ContentMetaType::AddOnContent => "AddOnContent",
            ContentMetaType::Delta => "Delta",
            ContentMetaType::DataPatch => "DataPatch",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SystemProgram" => ContentMetaType::SystemProgram,
            "SystemData" => ContentMetaType::SystemData,
            "SystemUpdate" => ContentMetaType::SystemUpdate,
            "BootImagePackage" => ContentMetaType::BootImagePackage,
            "BootImagePackageSafe" => ContentMetaType::BootImagePackageSafe,
            "Application" => ContentMetaType::Application,
            "Patch" => ContentMetaType::Patch,
            "AddOnContent" => ContentMetaType::AddOnContent,
            "Delta" => ContentMetaType::Delta,
            "DataPatch" => ContentMetaType::DataPatch,
            _ => return None,
        })
    }

    /// Types whose extended header declares a non-zero extended data block.
    pub fn carries_extended_data(&self) -> bool {
        matches!(
            self,
            ContentMetaType::SystemUpdate
                | ContentMetaType::Patch
                | ContentMetaType::Delta
                | ContentMetaType::DataPatch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum ContentMetaPlatform {
    /// NX (Nintendo Switch)
    NX = 0x00,
}
