//! Synthetic NCA images for unit tests.
//!
//! Everything is built in memory with the same primitives the parser uses,
//! so fixtures stay valid if constants change.

use super::*;
use cipher::{BlockEncryptMut, KeyInit};

pub const TEST_CTR_KEY: [u8; 0x10] = [0xAA; 0x10];
pub const TEST_CTR_SEED: u64 = 0x1122334455667788;

pub fn test_keyset() -> Keyset {
    let keys = r#"
    header_key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
    key_area_key_application_00 = 2b7e151628aed2a6abf7158809cf4f3c
    titlekek_00 = 603deb1015ca71be2b73aef0857d7781
    "#;
    Keyset::from_reader(std::io::Cursor::new(keys)).unwrap()
}

pub fn test_header() -> NcaHeader {
    NcaHeader {
        header_sig: RSASignature::default(),
        header_key_sig: RSASignature::default(),
        nca_version: NcaVersion::from_char('3'),
        distribution: DistributionType::Download,
        content_type: ContentType::Program,
        key_generation_old: KeyGenerationOld::Gen1_0_0,
        key_area_appkey_index: KeyAreaEncryptionKeyIndex::Application,
        content_size: 0,
        program_id: 0x0100_0000_0000_C0DE,
        content_index: 0,
        sdk_version: 0,
        key_generation: 0,
        signature_key_generation: 0,
        _reserved_e: [0; 0xE],
        rights_id: [0; 0x10],
        fs_entries: vec![FsEntry::default(); 4],
        fs_header_hashes: vec![[0; 0x20]; 4],
        encrypted_keys: KeyArea::default(),
    }
}

/// Key area carrying [`TEST_CTR_KEY`], wrapped under the generation-0
/// application key-area key of [`test_keyset`].
pub fn encrypted_test_key_area(keyset: &Keyset) -> KeyArea {
    let kaek = keyset.get_key_area_key_application(0).unwrap();
    ecb_encrypt_key_area(&TEST_CTR_KEY, &kaek)
}

fn ecb_encrypt_key_area(dec_ctr_key: &[u8; 0x10], kaek: &[u8; 0x10]) -> KeyArea {
    type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;

    let mut raw = [0u8; 0x40];
    raw[0x20..0x30].copy_from_slice(dec_ctr_key);

    let mut encryptor = Aes128EcbEnc::new_from_slice(kaek).unwrap();
    for chunk in raw.chunks_exact_mut(0x10) {
        encryptor.encrypt_blocks_mut(std::slice::from_mut(aes::Block::from_mut_slice(chunk)));
    }

    let mut area = KeyArea::default();
    area.aes_xts_key.copy_from_slice(&raw[..0x20]);
    area.aes_ctr_key.copy_from_slice(&raw[0x20..0x30]);
    area._reserved.copy_from_slice(&raw[0x30..]);
    area
}

fn serialize_fs_header(fs_header: &FsHeader) -> Vec<u8> {
    let mut cursor = binrw::io::Cursor::new(Vec::new());
    fs_header.write_le(&mut cursor).unwrap();
    let mut bytes = cursor.into_inner();
    bytes.resize(NCA_FS_HEADER_SIZE, 0);
    bytes
}

/// Full NCA image assembly from a decrypted main header, one FS header and
/// the ciphertext body placed at 0xC00.
pub fn assemble_nca(
    mut header: NcaHeader,
    fs_headers: &[(usize, FsHeader)],
    encrypted_body: &[u8],
    keyset: &Keyset,
) -> Vec<u8> {
    let mut block = vec![0u8; NCA_FULL_HEADER_SIZE];

    for (idx, fs_header) in fs_headers {
        let bytes = serialize_fs_header(fs_header);
        let start = 0x400 + idx * NCA_FS_HEADER_SIZE;
        block[start..start + NCA_FS_HEADER_SIZE].copy_from_slice(&bytes);
        header.fs_header_hashes[*idx] = Sha256::digest(&bytes).into();
    }

    header.content_size = (NCA_FULL_HEADER_SIZE + encrypted_body.len()) as u64;
    let main = header.to_bytes();
    block[..NCA_MAIN_HEADER_SIZE].copy_from_slice(&main);

    encrypt_header_block(&mut block, keyset.header_key().unwrap());
    block.extend_from_slice(encrypted_body);
    block
}

/// Builds an NCA with one AES-CTR section (no hash tree) whose plaintext
/// body is a deterministic byte ramp. Returns (image, keyset, plaintext).
pub fn build_plain_ctr_nca(content_type: ContentType, body_size: usize) -> (Vec<u8>, Keyset, Vec<u8>) {
    let body_size = align_up(body_size as u64, NCA_MEDIA_BLOCK_SIZE) as usize;
    let plain_body: Vec<u8> = (0..body_size).map(|i| (i % 251) as u8).collect();
    let (image, keyset) = build_ctr_nca(content_type, FsType::RomFs, &plain_body);
    (image, keyset, plain_body)
}

/// Builds an NCA with one AES-CTR section (no hash tree) around the given
/// plaintext body. The body is padded up to the media block size.
pub fn build_ctr_nca(
    content_type: ContentType,
    fs_type: FsType,
    body: &[u8],
) -> (Vec<u8>, Keyset) {
    let keyset = test_keyset();
    let body_size = align_up(body.len() as u64, NCA_MEDIA_BLOCK_SIZE) as usize;
    let mut plain_body = body.to_vec();
    plain_body.resize(body_size, 0);

    let section_offset = NCA_FULL_HEADER_SIZE as u64;
    let mut encrypted_body = plain_body;
    apply_aes_ctr(&TEST_CTR_KEY, TEST_CTR_SEED, section_offset, &mut encrypted_body);

    let fs_header = FsHeader {
        version: 2,
        fs_type,
        hash_type: HashType::None,
        encryption_type: EncryptionType::AesCtr,
        metadata_hash_type: MetaDataHashType::None,
        _reserved: [0; 2],
        hash_data: HashData::None { _raw: vec![0; 0xF8] },
        patch_info: PatchInfo::default(),
        ctr: TEST_CTR_SEED,
        sparse_info: vec![0; 0x30],
        compression_info: vec![0; 0x28],
        metadata_hashdata_info: vec![0; 0x30],
        _reserved2: vec![0; 0x30],
    };

    let mut header = test_header();
    header.content_type = content_type;
    header.distribution = DistributionType::GameCard;
    header.encrypted_keys = encrypted_test_key_area(&keyset);
    header.fs_entries[0] = FsEntry {
        start_offset: (section_offset / NCA_MEDIA_BLOCK_SIZE) as u32,
        end_offset: ((section_offset + body_size as u64) / NCA_MEDIA_BLOCK_SIZE) as u32,
        _reserved: 0,
    };

    let image = assemble_nca(header, &[(0, fs_header)], &encrypted_body, &keyset);
    (image, keyset)
}

/// Layout of a hash-tree-backed fixture section.
pub struct Sha256NcaLayout {
    pub image: Vec<u8>,
    pub keyset: Keyset,
    /// Section-relative offset of the data layer.
    pub data_offset: u64,
    pub data_size: u64,
}

/// Builds an NCA with one AES-CTR HierarchicalSha256 section holding
/// `data` in its data layer, hash table and master hash all consistent.
pub fn build_sha256_nca(
    content_type: ContentType,
    fs_type: FsType,
    hash_block_size: u64,
    data: &[u8],
) -> Sha256NcaLayout {
    let keyset = test_keyset();
    let section_offset = NCA_FULL_HEADER_SIZE as u64;

    let data_size = align_up(data.len() as u64, hash_block_size);
    let mut body_data = data.to_vec();
    body_data.resize(data_size as usize, 0);

    let block_count = data_size / hash_block_size;
    let hash_table_size = block_count * 0x20;
    let hash_table_offset = 0u64;
    let data_offset = align_up(hash_table_size, hash_block_size);

    let mut hash_table = Vec::with_capacity(hash_table_size as usize);
    for block in body_data.chunks(hash_block_size as usize) {
        hash_table.extend_from_slice(&Sha256::digest(block));
    }
    let master_hash: [u8; 0x20] = Sha256::digest(&hash_table).into();

    let section_size = align_up(data_offset + data_size, NCA_MEDIA_BLOCK_SIZE);
    let mut plaintext = vec![0u8; section_size as usize];
    plaintext[..hash_table.len()].copy_from_slice(&hash_table);
    plaintext[data_offset as usize..(data_offset + data_size) as usize]
        .copy_from_slice(&body_data);

    let mut encrypted = plaintext;
    apply_aes_ctr(&TEST_CTR_KEY, TEST_CTR_SEED, section_offset, &mut encrypted);

    let fs_header = FsHeader {
        version: 2,
        fs_type,
        hash_type: HashType::HierarchicalSha256Hash,
        encryption_type: EncryptionType::AesCtr,
        metadata_hash_type: MetaDataHashType::None,
        _reserved: [0; 2],
        hash_data: HashData::HierarchicalSha256 {
            master_hash,
            hash_block_size: hash_block_size as u32,
            layer_count: 2,
            hash_table_offset,
            hash_table_size,
            pfs0_offset: data_offset,
            pfs0_size: data_size,
            _reserved: vec![0; 0x80],
        },
        patch_info: PatchInfo::default(),
        ctr: TEST_CTR_SEED,
        sparse_info: vec![0; 0x30],
        compression_info: vec![0; 0x28],
        metadata_hashdata_info: vec![0; 0x30],
        _reserved2: vec![0; 0x30],
    };

    let mut header = test_header();
    header.content_type = content_type;
    header.encrypted_keys = encrypted_test_key_area(&keyset);
    header.fs_entries[0] = FsEntry {
        start_offset: (section_offset / NCA_MEDIA_BLOCK_SIZE) as u32,
        end_offset: ((section_offset + section_size) / NCA_MEDIA_BLOCK_SIZE) as u32,
        _reserved: 0,
    };

    let image = assemble_nca(header, &[(0, fs_header)], &encrypted, &keyset);
    Sha256NcaLayout {
        image,
        keyset,
        data_offset,
        data_size,
    }
}
