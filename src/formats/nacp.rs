//! NACP application control data.
//!
//! A fixed 0x4000-byte structure stored as `/control.nacp` in the Control
//! NCA's RomFS: 16 per-language (name, publisher) slots, policy bytes,
//! rating ages, save sizes, local-communication IDs. Icons sit next to it
//! as `icon_<Language>.dat` JPEG files.
//!
//! Besides parsing, this module carries the dump pipeline's orthogonal
//! NACP patches (linked account, screenshots, video capture, HDCP) and the
//! authoring-tool XML emitter.

use binrw::prelude::*;

use crate::error::Error;

/// Serialised NACP size.
pub const NACP_SIZE: usize = 0x4000;
/// Icons never exceed this.
pub const NACP_MAX_ICON_SIZE: u64 = 0x20000;
/// RomFS path of the control structure inside a Control NCA.
pub const NACP_ROMFS_PATH: &str = "/control.nacp";

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NacpTitle {
    pub name: [u8; 0x200],
    pub publisher: [u8; 0x100],
}

impl Default for NacpTitle {
    fn default() -> Self {
        Self {
            name: [0; 0x200],
            publisher: [0; 0x100],
        }
    }
}

impl NacpTitle {
    pub fn name_str(&self) -> &str {
        nul_terminated(&self.name)
    }

    pub fn publisher_str(&self) -> &str {
        nul_terminated(&self.publisher)
    }

    pub fn is_populated(&self) -> bool {
        !self.name_str().is_empty() && !self.publisher_str().is_empty()
    }
}

/// Language slots, in both storage order and lookup priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NacpLanguage {
    AmericanEnglish = 0,
    BritishEnglish = 1,
    Japanese = 2,
    French = 3,
    German = 4,
    LatinAmericanSpanish = 5,
    Spanish = 6,
    Italian = 7,
    Dutch = 8,
    CanadianFrench = 9,
    Portuguese = 10,
    Russian = 11,
    Korean = 12,
    TraditionalChinese = 13,
    SimplifiedChinese = 14,
    BrazilianPortuguese = 15,
}

impl NacpLanguage {
    pub const ALL: [NacpLanguage; 16] = [
        NacpLanguage::AmericanEnglish,
        NacpLanguage::BritishEnglish,
        NacpLanguage::Japanese,
        NacpLanguage::French,
        NacpLanguage::German,
        NacpLanguage::LatinAmericanSpanish,
        NacpLanguage::Spanish,
        NacpLanguage::Italian,
        NacpLanguage::Dutch,
        NacpLanguage::CanadianFrench,
        NacpLanguage::Portuguese,
        NacpLanguage::Russian,
        NacpLanguage::Korean,
        NacpLanguage::TraditionalChinese,
        NacpLanguage::SimplifiedChinese,
        NacpLanguage::BrazilianPortuguese,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NacpLanguage::AmericanEnglish => "AmericanEnglish",
            NacpLanguage::BritishEnglish => "BritishEnglish",
            NacpLanguage::Japanese => "Japanese",
            NacpLanguage::French => "French",
            NacpLanguage::German => "German",
            NacpLanguage::LatinAmericanSpanish => "LatinAmericanSpanish",
            NacpLanguage::Spanish => "Spanish",
            NacpLanguage::Italian => "Italian",
            NacpLanguage::Dutch => "Dutch",
            NacpLanguage::CanadianFrench => "CanadianFrench",
            NacpLanguage::Portuguese => "Portuguese",
            NacpLanguage::Russian => "Russian",
            NacpLanguage::Korean => "Korean",
            NacpLanguage::TraditionalChinese => "TraditionalChinese",
            NacpLanguage::SimplifiedChinese => "SimplifiedChinese",
            NacpLanguage::BrazilianPortuguese => "BrazilianPortuguese",
        }
    }

    /// RomFS icon file name for this language.
    pub fn icon_file_name(&self) -> String {
        format!("icon_{}.dat", self.as_str())
    }
}

pub const NACP_STARTUP_USER_ACCOUNT: [&str; 3] = [
    "None",
    "Required",
    "RequiredWithNetworkServiceAccountAvailable",
];
pub const NACP_SCREENSHOT: [&str; 2] = ["Allow", "Deny"];
pub const NACP_VIDEO_CAPTURE: [&str; 3] = ["Disable", "Manual", "Enable"];
pub const NACP_HDCP: [&str; 2] = ["None", "Required"];
pub const NACP_PLAY_LOG_POLICY: [&str; 4] = ["All", "LogOnly", "None", "Closed"];

pub const NACP_SCREENSHOT_ALLOW: u8 = 0;
pub const NACP_VIDEO_CAPTURE_ENABLE: u8 = 2;
pub const NACP_HDCP_NONE: u8 = 0;
/// StartupUserAccountOption bit: save data is tied to a linked account.
pub const NACP_STARTUP_USER_ACCOUNT_OPTION_REQUIRED_FOR_REGISTRATION: u8 = 1 << 0;

pub const NACP_RATING_ORGANIZATIONS: [&str; 13] = [
    "CERO",
    "GRACGCRB",
    "GSRMR",
    "ESRB",
    "ClassInd",
    "USK",
    "PEGI",
    "PEGIPortugal",
    "PEGIBBFC",
    "Russian",
    "ACB",
    "OFLC",
    "IARCGeneric",
];

/// The 0x4000-byte application control structure.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct Nacp {
    #[br(count = 16)]
    pub titles: Vec<NacpTitle>,
    pub isbn: [u8; 0x25],
    pub startup_user_account: u8,
    pub user_account_switch_lock: u8,
    pub add_on_content_registration_type: u8,
    pub attribute_flag: u32,
    pub supported_language_flag: u32,
    pub parental_control_flag: u32,
    pub screenshot: u8,
    pub video_capture: u8,
    pub data_loss_confirmation: u8,
    pub play_log_policy: u8,
    pub presence_group_id: u64,
    /// Per-organisation rating ages; 0xFF marks an absent rating.
    pub rating_age: [u8; 0x20],
    pub display_version: [u8; 0x10],
    pub add_on_content_base_id: u64,
    pub save_data_owner_id: u64,
    pub user_account_save_data_size: i64,
    pub user_account_save_data_journal_size: i64,
    pub device_save_data_size: i64,
    pub device_save_data_journal_size: i64,
    pub bcat_delivery_cache_storage_size: i64,
    pub application_error_code_category: [u8; 0x8],
    pub local_communication_id: [u64; 8],
    pub logo_type: u8,
    pub logo_handling: u8,
    pub runtime_add_on_content_install: u8,
    pub runtime_parameter_delivery: u8,
    pub _reserved_30f4: [u8; 2],
    pub crash_report: u8,
    pub hdcp: u8,
    pub seed_for_pseudo_device_id: u64,
    pub bcat_passphrase: [u8; 0x41],
    pub startup_user_account_option: u8,
    pub _reserved_3142: [u8; 6],
    #[br(count = NACP_SIZE - 0x3148)]
    pub tail: Vec<u8>,
}

impl Default for Nacp {
    fn default() -> Self {
        Self {
            titles: vec![NacpTitle::default(); 16],
            isbn: [0; 0x25],
            startup_user_account: 0,
            user_account_switch_lock: 0,
            add_on_content_registration_type: 0,
            attribute_flag: 0,
            supported_language_flag: 0,
            parental_control_flag: 0,
            screenshot: 0,
            video_capture: 0,
            data_loss_confirmation: 0,
            play_log_policy: 0,
            presence_group_id: 0,
            rating_age: [0xFF; 0x20],
            display_version: [0; 0x10],
            add_on_content_base_id: 0,
            save_data_owner_id: 0,
            user_account_save_data_size: 0,
            user_account_save_data_journal_size: 0,
            device_save_data_size: 0,
            device_save_data_journal_size: 0,
            bcat_delivery_cache_storage_size: 0,
            application_error_code_category: [0; 0x8],
            local_communication_id: [0; 8],
            logo_type: 0,
            logo_handling: 0,
            runtime_add_on_content_install: 0,
            runtime_parameter_delivery: 0,
            _reserved_30f4: [0; 2],
            crash_report: 0,
            hdcp: 0,
            seed_for_pseudo_device_id: 0,
            bcat_passphrase: [0; 0x41],
            startup_user_account_option: 0,
            _reserved_3142: [0; 6],
            tail: vec![0; NACP_SIZE - 0x3148],
        }
    }
}

impl Nacp {
    pub fn from_bytes(blob: &[u8]) -> Result<Self, Error> {
        if blob.len() != NACP_SIZE {
            return Err(Error::InvalidNacp(format!(
                "control structure is {:#x} bytes, expected {:#x}",
                blob.len(),
                NACP_SIZE
            )));
        }
        let nacp: Nacp = binrw::io::Cursor::new(blob).read_le()?;
        Ok(nacp)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.write_le(&mut cursor)?;
        let out = cursor.into_inner();
        debug_assert_eq!(out.len(), NACP_SIZE);
        Ok(out)
    }

    /// First populated (name and publisher) language slot, in priority
    /// order. Returns None when no slot is populated.
    pub fn get_language_entry(&self) -> Option<(NacpLanguage, &NacpTitle)> {
        NacpLanguage::ALL
            .iter()
            .map(|&lang| (lang, &self.titles[lang as usize]))
            .find(|(_, title)| title.is_populated())
    }

    pub fn display_version_str(&self) -> &str {
        nul_terminated(&self.display_version)
    }

    /// Languages whose bit is set in `supported_language_flag`.
    pub fn supported_languages(&self) -> Vec<NacpLanguage> {
        NacpLanguage::ALL
            .iter()
            .copied()
            .filter(|&lang| self.supported_language_flag & (1u32 << (lang as u8)) != 0)
            .collect()
    }

    /// Icon file names expected in the Control NCA's RomFS.
    pub fn icon_file_names(&self) -> Vec<(NacpLanguage, String)> {
        self.supported_languages()
            .into_iter()
            .map(|lang| (lang, lang.icon_file_name()))
            .collect()
    }

    /// Emits the authoring-tool XML mirror of this structure.
    pub fn generate_authoring_tool_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        xml.push_str("<Application>\n");

        for (lang, title) in NacpLanguage::ALL
            .iter()
            .map(|&lang| (lang, &self.titles[lang as usize]))
            .filter(|(_, title)| title.is_populated())
        {
            xml.push_str("  <Title>\n");
            xml.push_str(&format!("    <Language>{}</Language>\n", lang.as_str()));
            xml.push_str(&format!("    <Name>{}</Name>\n", xml_escape(title.name_str())));
            xml.push_str(&format!(
                "    <Publisher>{}</Publisher>\n",
                xml_escape(title.publisher_str())
            ));
            xml.push_str("  </Title>\n");
        }

        xml.push_str(&format!(
            "  <StartupUserAccount>{}</StartupUserAccount>\n",
            enum_str(&NACP_STARTUP_USER_ACCOUNT, self.startup_user_account)
        ));
        xml.push_str(&format!(
            "  <Screenshot>{}</Screenshot>\n",
            enum_str(&NACP_SCREENSHOT, self.screenshot)
        ));
        xml.push_str(&format!(
            "  <VideoCapture>{}</VideoCapture>\n",
            enum_str(&NACP_VIDEO_CAPTURE, self.video_capture)
        ));
        xml.push_str(&format!(
            "  <PlayLogPolicy>{}</PlayLogPolicy>\n",
            enum_str(&NACP_PLAY_LOG_POLICY, self.play_log_policy)
        ));
        xml.push_str(&format!("  <Hdcp>{}</Hdcp>\n", enum_str(&NACP_HDCP, self.hdcp)));
        xml.push_str(&format!(
            "  <DisplayVersion>{}</DisplayVersion>\n",
            xml_escape(self.display_version_str())
        ));
        xml.push_str(&format!(
            "  <PresenceGroupId>0x{:016x}</PresenceGroupId>\n",
            self.presence_group_id
        ));
        xml.push_str(&format!(
            "  <SaveDataOwnerId>0x{:016x}</SaveDataOwnerId>\n",
            self.save_data_owner_id
        ));
        xml.push_str(&format!(
            "  <UserAccountSaveDataSize>{}</UserAccountSaveDataSize>\n",
            self.user_account_save_data_size
        ));
        xml.push_str(&format!(
            "  <UserAccountSaveDataJournalSize>{}</UserAccountSaveDataJournalSize>\n",
            self.user_account_save_data_journal_size
        ));
        xml.push_str(&format!(
            "  <DeviceSaveDataSize>{}</DeviceSaveDataSize>\n",
            self.device_save_data_size
        ));
        xml.push_str(&format!(
            "  <DeviceSaveDataJournalSize>{}</DeviceSaveDataJournalSize>\n",
            self.device_save_data_journal_size
        ));
        xml.push_str(&format!(
            "  <AddOnContentBaseId>0x{:016x}</AddOnContentBaseId>\n",
            self.add_on_content_base_id
        ));

        for id in self.local_communication_id.iter().filter(|&&id| id != 0) {
            xml.push_str(&format!(
                "  <LocalCommunicationId>0x{:016x}</LocalCommunicationId>\n",
                id
            ));
        }

        for (org, &age) in NACP_RATING_ORGANIZATIONS.iter().zip(self.rating_age.iter()) {
            if age != 0xFF {
                xml.push_str("  <Rating>\n");
                xml.push_str(&format!("    <Organization>{}</Organization>\n", org));
                xml.push_str(&format!("    <Age>{}</Age>\n", age));
                xml.push_str("  </Rating>\n");
            }
        }

        xml.push_str("</Application>\n");
        xml
    }
}

/// Orthogonal NACP rewrites offered by the NSP builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NacpPatchOptions {
    /// Clear the linked-account-required bit of the startup user account
    /// options.
    pub disable_linked_account: bool,
    /// Force `screenshot` to Allow.
    pub enable_screenshots: bool,
    /// Force `video_capture` to Enable.
    pub enable_video_capture: bool,
    /// Force `hdcp` to None.
    pub disable_hdcp: bool,
}

impl NacpPatchOptions {
    pub fn any(&self) -> bool {
        self.disable_linked_account
            || self.enable_screenshots
            || self.enable_video_capture
            || self.disable_hdcp
    }

    /// Applies the requested rewrites; returns true when any byte changed.
    pub fn apply(&self, nacp: &mut Nacp) -> bool {
        let mut changed = false;

        if self.disable_linked_account
            && nacp.startup_user_account_option
                & NACP_STARTUP_USER_ACCOUNT_OPTION_REQUIRED_FOR_REGISTRATION
                != 0
        {
            nacp.startup_user_account_option &=
                !NACP_STARTUP_USER_ACCOUNT_OPTION_REQUIRED_FOR_REGISTRATION;
            changed = true;
        }
        if self.enable_screenshots && nacp.screenshot != NACP_SCREENSHOT_ALLOW {
            nacp.screenshot = NACP_SCREENSHOT_ALLOW;
            changed = true;
        }
        if self.enable_video_capture && nacp.video_capture != NACP_VIDEO_CAPTURE_ENABLE {
            nacp.video_capture = NACP_VIDEO_CAPTURE_ENABLE;
            changed = true;
        }
        if self.disable_hdcp && nacp.hdcp != NACP_HDCP_NONE {
            nacp.hdcp = NACP_HDCP_NONE;
            changed = true;
        }

        changed
    }
}

fn nul_terminated(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn enum_str(table: &[&'static str], value: u8) -> &'static str {
    table.get(value as usize).copied().unwrap_or("Unknown")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
