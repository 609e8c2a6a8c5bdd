use binrw::prelude::*;

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct RSASignature {
    pub signature: [[u8; 0x20]; 8],
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The source of the content the NCA is for, either downloaded from
/// the CDN or from a game card (cartridge).
pub enum DistributionType {
    /// The content was downloaded from a CDN, such as the eShop.
    Download = 0x00,
    /// The content is from a game card (cartridge).
    GameCard = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The type of content stored in the NCA.
pub enum ContentType {
    /// Program content (executable code).
    Program = 0x00,
    /// Meta content (information about the title).
    Meta = 0x01,
    /// Control content (icon, NACP, etc.).
    Control = 0x02,
    /// Manual content (HTML documents, legal information).
    Manual = 0x03,
    /// Data content (general game data).
    Data = 0x04,
    /// Public data content.
    PublicData = 0x05,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The key generation used for the NCA.
pub enum KeyGenerationOld {
    /// 1.0.0 key generation
    Gen1_0_0 = 0x00,
    /// Unknown key generation (presumably planned for Horizon 2.0.0 but never used)
    Unused = 0x01,
    /// 3.0.0 key generation
    Gen3_0_0 = 0x02,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The encryption key index used for the key area in the NCA header.
pub enum KeyAreaEncryptionKeyIndex {
    /// Application key area encryption key.
    Application = 0x00,
    /// Ocean key area encryption key.
    Ocean = 0x01,
    /// System key area encryption key.
    System = 0x02,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Filesystem format type
pub enum FsType {
    /// RomFS filesystem
    RomFs = 0x00,
    /// Partition filesystem
    PartitionFs = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Hash type used for filesystem verification
pub enum HashType {
    #[default]
    /// Automatically select hash type
    Auto = 0x00,
    /// No hash verification
    None = 0x01,
    /// Hierarchical SHA256 hash
    HierarchicalSha256Hash = 0x02,
    /// Hierarchical integrity hash (IVFC)
    HierarchicalIntegrityHash = 0x03,
    /// [14.0.0+] Automatically select SHA3 hash
    AutoSha3 = 0x04,
    /// [14.0.0+] Hierarchical SHA3-256 hash
    HierarchicalSha3256Hash = 0x05,
    /// [14.0.0+] Hierarchical integrity SHA3 hash
    HierarchicalIntegritySha3Hash = 0x06,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Encryption type for NCA content
pub enum EncryptionType {
    /// Automatically select encryption type
    Auto = 0x00,
    /// No encryption
    None = 0x01,
    /// AES-XTS encryption
    AesXts = 0x02,
    /// AES-CTR encryption
    AesCtr = 0x03,
    /// AES-CTR extended encryption (patch sections)
    AesCtrEx = 0x04,
    /// [14.0.0+] AES-CTR encryption with skipped layer hash
    AesCtrSkipLayerHash = 0x05,
    /// [14.0.0+] AES-CTR extended encryption with skipped layer hash
    AesCtrExSkipLayerHash = 0x06,
}

impl EncryptionType {
    /// True for the AES-CTR family (plain and skip-layer-hash variants).
    pub fn is_ctr(&self) -> bool {
        matches!(self, EncryptionType::AesCtr | EncryptionType::AesCtrSkipLayerHash)
    }

    /// True for the AES-CTR-Ex family used by patch sections.
    pub fn is_ctr_ex(&self) -> bool {
        matches!(self, EncryptionType::AesCtrEx | EncryptionType::AesCtrExSkipLayerHash)
    }
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// [14.0.0+] Hash type for metadata
pub enum MetaDataHashType {
    /// No metadata hash
    None = 0x00,
    /// Hierarchical integrity hash for metadata
    HierarchicalIntegrity = 0x01,
}

/// Derived classification of an NCA FS section, combining format type,
/// hash type and encryption type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaFsSectionType {
    PartitionFs,
    RomFs,
    PatchRomFs,
    Nca0RomFs,
    Invalid,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct FsEntry {
    /// StartOffset (in blocks of 0x200 bytes) of the section
    pub start_offset: u32,
    /// EndOffset (in blocks of 0x200 bytes) of the section
    pub end_offset: u32,
    /// Unknown
    pub _reserved: u64,
}

impl FsEntry {
    pub fn is_enabled(&self) -> bool {
        self.start_offset != 0 || self.end_offset != 0
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
#[br(import(hash_type: HashType))]
pub enum HashData {
    #[br(pre_assert(matches!(hash_type, HashType::HierarchicalSha256Hash | HashType::HierarchicalSha3256Hash)))]
    HierarchicalSha256 {
        master_hash: [u8; 0x20],
        hash_block_size: u32,
        layer_count: u32,
        hash_table_offset: u64,
        hash_table_size: u64,
        pfs0_offset: u64,
        pfs0_size: u64,
        #[br(count = 0x80)]
        #[brw(pad_size_to = 0x80)]
        _reserved: Vec<u8>,
    },
    #[br(pre_assert(matches!(hash_type, HashType::HierarchicalIntegrityHash | HashType::HierarchicalIntegritySha3Hash)))]
    HierarchicalIntegrity {
        #[brw(magic = b"IVFC")]
        version: u32,
        master_hash_size: u32,
        #[brw(pad_size_to = 0xB4)]
        info_level_hash: InfoLevelHash,
        master_hash: [u8; 0x20],
        #[br(count = 0x18)]
        #[brw(pad_size_to = 0x18)]
        _reserved: Vec<u8>,
    },
    /// Sections with no hash tree (NCA0 bodies, skip-layer-hash sections).
    None {
        #[br(count = 0xF8)]
        #[brw(pad_size_to = 0xF8)]
        _raw: Vec<u8>,
    },
}

impl HashData {
    /// Offset (section-relative) and size of the actual plaintext data layer.
    pub fn data_layer(&self) -> (u64, u64) {
        match self {
            HashData::HierarchicalSha256 {
                pfs0_offset,
                pfs0_size,
                ..
            } => (*pfs0_offset, *pfs0_size),
            HashData::HierarchicalIntegrity {
                info_level_hash, ..
            } => info_level_hash
                .levels
                .last()
                .map(|l| (l.offset, l.size))
                .unwrap_or((0, 0)),
            HashData::None { .. } => (0, 0),
        }
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoLevelHash {
    pub max_layers: u32,
    #[brw(pad_size_to = 0x90)]
    #[br(count = if max_layers > 0 { (max_layers - 1) as usize } else { 0 })]
    pub levels: Vec<HierarchicalIntegrityLevelInfo>,
    pub signature_salt: [u8; 0x20],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchicalIntegrityLevelInfo {
    pub offset: u64,
    pub size: u64,
    pub block_size_log2: u32,
    pub _reserved: [u8; 0x4],
}

/// One BKTR bucket tree declaration inside the patch info area.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BucketTreeHeader {
    /// Section-relative offset of the block.
    pub offset: u64,
    /// Byte size of the block.
    pub size: u64,
    /// "BKTR" when the block is present.
    pub magic: [u8; 4],
    pub version: u32,
    pub entry_count: u32,
    pub _reserved: u32,
}

impl BucketTreeHeader {
    pub const MAGIC: [u8; 4] = *b"BKTR";

    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC
    }
}

/// Patch info area of a PatchRomFs section: indirect storage plus
/// AES-CTR-Ex storage bucket trees.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchInfo {
    pub indirect: BucketTreeHeader,
    pub aes_ctr_ex: BucketTreeHeader,
}

impl PatchInfo {
    pub fn is_present(&self) -> bool {
        self.indirect.is_valid() && self.aes_ctr_ex.is_valid()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
// The FsHeader for each section is at offset 0x400 + (sectionid * 0x200),
// where sectionid corresponds to the index used with the entry/hash tables.
/// NCA filesystem header
pub struct FsHeader {
    /// The filesystem version for the NCA.
    ///
    /// In most cases, this should always be a 2.
    pub version: u16,
    /// The type of filesystem used in this section.
    pub fs_type: FsType,
    /// The hash type used for filesystem verification.
    pub hash_type: HashType,
    /// The encryption type used for the filesystem.
    pub encryption_type: EncryptionType,
    /// Metadata hash type, only used in 14.0.0+ NCAs.
    pub metadata_hash_type: MetaDataHashType,
    pub _reserved: [u8; 0x2],
    #[br(args(hash_type))]
    #[brw(pad_size_to = 0xF8)]
    pub hash_data: HashData,
    #[brw(pad_size_to = 0x40)]
    pub patch_info: PatchInfo,
    /// Upper half of the AES-CTR IV (nonce seed).
    pub ctr: u64,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub sparse_info: Vec<u8>,
    #[br(count = 0x28)]
    #[brw(pad_size_to = 0x28)]
    pub compression_info: Vec<u8>,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub metadata_hashdata_info: Vec<u8>,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub _reserved2: Vec<u8>,
}

impl FsHeader {
    /// A sparse layer is declared when its bucket header region is non-zero.
    pub fn has_sparse_layer(&self) -> bool {
        self.sparse_info.iter().any(|&b| b != 0)
    }

    /// A compression layer is declared when its bucket header region is non-zero.
    pub fn has_compression_layer(&self) -> bool {
        self.compression_info.iter().any(|&b| b != 0)
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
/// The key area from the NCA
pub struct KeyArea {
    /// AES-XTS keys
    pub aes_xts_key: [u8; 0x20],
    /// AES-CTR key
    pub aes_ctr_key: [u8; 0x10],
    /// Unknown
    pub _reserved: [u8; 0x10],
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn test_fs_entry_size() {
        let entry = FsEntry {
            start_offset: 0,
            end_offset: 100,
            _reserved: 0,
        };
        assert_eq!(std::mem::size_of_val(&entry), 16);
        assert!(entry.is_enabled());
        assert!(!FsEntry::default().is_enabled());
    }

    #[test]
    fn test_patch_info_roundtrip() {
        let info = PatchInfo {
            indirect: BucketTreeHeader {
                offset: 0x1000,
                size: 0x4000,
                magic: *b"BKTR",
                version: 1,
                entry_count: 2,
                _reserved: 0,
            },
            aes_ctr_ex: BucketTreeHeader {
                offset: 0x5000,
                size: 0x4000,
                magic: *b"BKTR",
                version: 1,
                entry_count: 1,
                _reserved: 0,
            },
        };
        assert!(info.is_present());

        let mut cursor = Cursor::new(Vec::new());
        info.write_le(&mut cursor).unwrap();
        assert_eq!(cursor.get_ref().len(), 0x40);

        let mut cursor = Cursor::new(cursor.into_inner());
        let parsed: PatchInfo = cursor.read_le().unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_fs_header_size() {
        let header = FsHeader {
            version: 2,
            fs_type: FsType::RomFs,
            hash_type: HashType::None,
            encryption_type: EncryptionType::AesCtr,
            metadata_hash_type: MetaDataHashType::None,
            _reserved: [0; 2],
            hash_data: HashData::None {
                _raw: vec![0; 0xF8],
            },
            patch_info: PatchInfo::default(),
            ctr: 0,
            sparse_info: vec![0; 0x30],
            compression_info: vec![0; 0x28],
            metadata_hashdata_info: vec![0; 0x30],
            _reserved2: vec![0; 0x30],
        };

        let mut cursor = Cursor::new(Vec::new());
        header.write_le(&mut cursor).unwrap();
        assert_eq!(cursor.get_ref().len(), 0x200);
        assert!(!header.has_sparse_layer());
        assert!(!header.has_compression_layer());
    }
}
