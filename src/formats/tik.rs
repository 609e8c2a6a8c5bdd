//! Ticket parsing, personalisation stripping, and certificate chains.
//!
//! A ticket is a signature block (type + signature + issuer) followed by a
//! fixed signed block carrying the encrypted titlekey and its metadata,
//! then a variable trailing section table. Signatures are parsed but never
//! verified here.
//!
//! Personalised tickets wrap the titlekey with RSA-2048-OAEP to a single
//! console. Stripping personalisation decrypts that envelope through the
//! key oracle, re-wraps the titlekey the common way (AES-128-ECB under the
//! titlekek), zeroes every console-identifying field and truncates the
//! section table, leaving a ticket any console accepts.

use binrw::prelude::*;

use crate::error::Error;
use crate::keys::KeyOracle;
use crate::keys::title_keys::encrypt_titlekey_block;

pub const TICKET_FORMAT_VERSION: u8 = 2;

pub const TITLEKEY_TYPE_COMMON: u8 = 0;
pub const TITLEKEY_TYPE_PERSONALIZED: u8 = 1;

/// Issuer written into converted common tickets.
pub const COMMON_TICKET_ISSUER: &str = "Root-CA00000003-XS00000020";

/// Recognised signature types (RSA only; ECDSA tickets do not occur for
/// titlekey crypto).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SigType {
    Rsa4096Sha1 = 0x010000,
    Rsa2048Sha1 = 0x010001,
    Rsa4096Sha256 = 0x010003,
    Rsa2048Sha256 = 0x010004,
}

impl SigType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x010000 => SigType::Rsa4096Sha1,
            0x010001 => SigType::Rsa2048Sha1,
            0x010003 => SigType::Rsa4096Sha256,
            0x010004 => SigType::Rsa2048Sha256,
            _ => return None,
        })
    }

    /// Signature byte length plus alignment padding.
    pub fn signature_size(&self) -> usize {
        match self {
            SigType::Rsa4096Sha1 | SigType::Rsa4096Sha256 => 0x200 + 0x3C,
            SigType::Rsa2048Sha1 | SigType::Rsa2048Sha256 => 0x100 + 0x3C,
        }
    }
}

/// The fixed signed block of a ticket.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct TicketCommonBlock {
    pub issuer: [u8; 0x40],
    /// Encrypted titlekey: 0x10 bytes (common) or a full RSA-OAEP
    /// envelope (personalised).
    pub titlekey_block: [u8; 0x100],
    pub format_version: u8,
    /// 0 = common, 1 = personalised.
    pub titlekey_type: u8,
    pub ticket_version: u16,
    pub license_type: u8,
    /// Master key revision the titlekek is selected by.
    pub common_key_id: u8,
    pub property_mask: u16,
    pub _reserved: [u8; 0x8],
    pub ticket_id: u64,
    pub device_id: u64,
    pub rights_id: [u8; 0x10],
    pub account_id: u32,
    pub sect_total_size: u32,
    pub sect_hdr_offset: u32,
    pub sect_hdr_count: u16,
    pub sect_hdr_entry_size: u16,
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub sig_type: SigType,
    /// Raw signature bytes including alignment padding.
    pub signature: Vec<u8>,
    pub common: TicketCommonBlock,
    /// Trailing section-table bytes, kept opaque.
    pub section_records: Vec<u8>,
}

impl Ticket {
    pub fn from_bytes(blob: &[u8]) -> Result<Self, Error> {
        if blob.len() < 4 {
            return Err(Error::InvalidTicket("blob shorter than signature type".into()));
        }
        let raw_sig_type = u32::from_le_bytes(blob[..4].try_into().unwrap());
        let sig_type = SigType::from_raw(raw_sig_type).ok_or_else(|| {
            Error::InvalidTicket(format!("unrecognised signature type {:#x}", raw_sig_type))
        })?;

        let sig_size = sig_type.signature_size();
        let common_offset = 4 + sig_size;
        if blob.len() < common_offset {
            return Err(Error::InvalidTicket("blob shorter than signature".into()));
        }
        let signature = blob[4..common_offset].to_vec();

        let mut cursor = binrw::io::Cursor::new(&blob[common_offset..]);
        let common: TicketCommonBlock = cursor.read_le()?;
        let consumed = common_offset + cursor.position() as usize;
        let section_records = blob[consumed..].to_vec();

        if common.format_version != TICKET_FORMAT_VERSION {
            return Err(Error::InvalidTicket(format!(
                "format version {} unsupported",
                common.format_version
            )));
        }

        Ok(Self {
            sig_type,
            signature,
            common,
            section_records,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.sig_type as u32).to_le_bytes());
        out.extend_from_slice(&self.signature);
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.common.write_le(&mut cursor)?;
        out.extend_from_slice(&cursor.into_inner());
        out.extend_from_slice(&self.section_records);
        Ok(out)
    }

    pub fn issuer_str(&self) -> &str {
        let end = self
            .common
            .issuer
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.common.issuer.len());
        std::str::from_utf8(&self.common.issuer[..end]).unwrap_or("")
    }

    /// A usable ticket: current format and a non-zero rights ID.
    pub fn is_valid(&self) -> bool {
        self.common.format_version == TICKET_FORMAT_VERSION
            && !self.common.rights_id.iter().all(|&b| b == 0)
    }

    pub fn is_common(&self) -> bool {
        self.common.titlekey_type == TITLEKEY_TYPE_COMMON
    }

    pub fn is_personalized(&self) -> bool {
        self.common.titlekey_type == TITLEKEY_TYPE_PERSONALIZED
    }

    /// The encrypted titlekey as common tickets carry it.
    pub fn common_titlekey_block(&self) -> [u8; 0x10] {
        self.common.titlekey_block[..0x10].try_into().unwrap()
    }

    /// Checks the ticket against an NCA's declared rights ID.
    pub fn matches_rights_id(&self, rights_id: &[u8; 0x10]) -> bool {
        &self.common.rights_id == rights_id
    }

    /// Titlekek generation for this ticket's master key revision.
    pub fn key_generation(&self) -> u8 {
        self.common.common_key_id.max(1) - 1
    }

    /// Rewrites a personalised ticket into a common one.
    ///
    /// The RSA-OAEP envelope is decrypted through the oracle, the titlekey
    /// re-wrapped under the common titlekek, and every console-identifying
    /// field (ticket ID, device ID, account ID) zeroed. Returns the
    /// synthesised certificate chain for the new issuer.
    pub fn convert_personalized_to_common(
        &mut self,
        oracle: &dyn KeyOracle,
    ) -> Result<Vec<u8>, Error> {
        if !self.is_personalized() {
            return Err(Error::InvalidTicket("ticket is not personalised".into()));
        }

        let envelope: [u8; 0x100] = self.common.titlekey_block;
        let titlekey = oracle
            .rsa_oaep_decrypt_titlekey(&envelope)
            .ok_or_else(|| Error::MissingKey("console RSA key for titlekey envelope".into()))?;

        let titlekek = oracle
            .common_titlekek(self.key_generation())
            .ok_or_else(|| {
                Error::MissingKey(format!("titlekek generation {}", self.key_generation()))
            })?;
        let wrapped = encrypt_titlekey_block(&titlekey, &titlekek);

        self.common.titlekey_block = [0; 0x100];
        self.common.titlekey_block[..0x10].copy_from_slice(&wrapped);
        self.common.titlekey_type = TITLEKEY_TYPE_COMMON;

        self.sig_type = SigType::Rsa2048Sha256;
        self.signature = vec![0; SigType::Rsa2048Sha256.signature_size()];

        self.common.issuer = [0; 0x40];
        self.common.issuer[..COMMON_TICKET_ISSUER.len()]
            .copy_from_slice(COMMON_TICKET_ISSUER.as_bytes());

        self.common.ticket_id = 0;
        self.common.device_id = 0;
        self.common.account_id = 0;
        self.common.sect_total_size = 0;
        self.common.sect_hdr_offset = 0;
        self.common.sect_hdr_count = 0;
        self.common.sect_hdr_entry_size = 0;
        self.section_records.clear();

        tracing::trace!(
            rights_id = %hex::encode(self.common.rights_id),
            "personalised ticket converted to common"
        );

        synthesize_certificate_chain(COMMON_TICKET_ISSUER)
    }
}

// --- Certificate chain -----------------------------------------------------

const CERT_KEY_TYPE_RSA4096: u32 = 0;
const CERT_KEY_TYPE_RSA2048: u32 = 1;

/// One certificate record in the wire layout: signature block, issuer,
/// key type, subject name, and public-key body.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub sig_type: SigType,
    pub signature: Vec<u8>,
    pub issuer: String,
    pub key_type: u32,
    pub name: String,
    pub cert_id: u32,
    pub public_key: Vec<u8>,
}

impl Certificate {
    fn public_key_size(key_type: u32) -> usize {
        match key_type {
            // Modulus + exponent + padding.
            CERT_KEY_TYPE_RSA4096 => 0x200 + 0x4 + 0x34,
            CERT_KEY_TYPE_RSA2048 => 0x100 + 0x4 + 0x34,
            _ => 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.sig_type as u32).to_le_bytes());
        out.extend_from_slice(&self.signature);

        let mut issuer = [0u8; 0x40];
        issuer[..self.issuer.len()].copy_from_slice(self.issuer.as_bytes());
        out.extend_from_slice(&issuer);

        out.extend_from_slice(&self.key_type.to_le_bytes());

        let mut name = [0u8; 0x40];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        out.extend_from_slice(&name);

        out.extend_from_slice(&self.cert_id.to_le_bytes());
        out.extend_from_slice(&self.public_key);
        out
    }
}

/// The baked-in root record. Key material is not shipped with the core;
/// the record carries the wire shape and names, which is all chain
/// retrieval guarantees (signatures are never verified here).
fn root_certificate() -> Certificate {
    Certificate {
        sig_type: SigType::Rsa4096Sha256,
        signature: vec![0; SigType::Rsa4096Sha256.signature_size()],
        issuer: "Root".to_string(),
        key_type: CERT_KEY_TYPE_RSA4096,
        name: "CA00000003".to_string(),
        cert_id: 0,
        public_key: vec![0; Certificate::public_key_size(CERT_KEY_TYPE_RSA4096)],
    }
}

fn ca_certificate(ca_name: &str) -> Option<Certificate> {
    match ca_name {
        "CA00000003" | "CA00000004" => Some(Certificate {
            sig_type: SigType::Rsa4096Sha256,
            signature: vec![0; SigType::Rsa4096Sha256.signature_size()],
            issuer: "Root".to_string(),
            key_type: CERT_KEY_TYPE_RSA2048,
            name: ca_name.to_string(),
            cert_id: 0,
            public_key: vec![0; Certificate::public_key_size(CERT_KEY_TYPE_RSA2048)],
        }),
        _ => None,
    }
}

fn signer_certificate(ca_name: &str, signer_name: &str) -> Option<Certificate> {
    if !signer_name.starts_with("XS") {
        return None;
    }
    Some(Certificate {
        sig_type: SigType::Rsa2048Sha256,
        signature: vec![0; SigType::Rsa2048Sha256.signature_size()],
        issuer: format!("Root-{}", ca_name),
        key_type: CERT_KEY_TYPE_RSA2048,
        name: signer_name.to_string(),
        cert_id: 0,
        public_key: vec![0; Certificate::public_key_size(CERT_KEY_TYPE_RSA2048)],
    })
}

/// Builds a raw certificate chain (root, CA, ticket signer) for a ticket
/// issuer string like `Root-CA00000003-XS00000020`.
pub fn synthesize_certificate_chain(issuer: &str) -> Result<Vec<u8>, Error> {
    let mut parts = issuer.split('-');
    let root = parts.next();
    let ca_name = parts.next();
    let signer_name = parts.next();

    let (Some("Root"), Some(ca_name), Some(signer_name)) = (root, ca_name, signer_name) else {
        return Err(Error::InvalidTicket(format!(
            "malformed ticket issuer '{}'",
            issuer
        )));
    };

    let ca = ca_certificate(ca_name)
        .ok_or_else(|| Error::InvalidTicket(format!("unknown CA '{}'", ca_name)))?;
    let signer = signer_certificate(ca_name, signer_name)
        .ok_or_else(|| Error::InvalidTicket(format!("unknown signer '{}'", signer_name)))?;

    let mut chain = root_certificate().to_bytes();
    chain.extend_from_slice(&ca.to_bytes());
    chain.extend_from_slice(&signer.to_bytes());
    Ok(chain)
}

/// One slot of the on-cartridge certificate area: a rights ID, the chain
/// length, and the chain bytes, in fixed 0x1000-byte records.
pub const GAMECARD_CERT_RECORD_SIZE: usize = 0x1000;

/// Selects the certificate chain matching `rights_id` from the gamecard
/// certificate area supplied by the transport.
pub fn select_gamecard_chain(area: &[u8], rights_id: &[u8; 0x10]) -> Result<Vec<u8>, Error> {
    for record in area.chunks(GAMECARD_CERT_RECORD_SIZE) {
        if record.len() < 0x20 {
            break;
        }
        if &record[..0x10] != rights_id {
            continue;
        }
        let chain_size = u32::from_le_bytes(record[0x10..0x14].try_into().unwrap()) as usize;
        if 0x20 + chain_size > record.len() {
            return Err(Error::InvalidTicket(
                "gamecard certificate record overflows its slot".into(),
            ));
        }
        return Ok(record[0x20..0x20 + chain_size].to_vec());
    }
    Err(Error::NotFound(format!(
        "certificate chain for rights ID {}",
        hex::encode(rights_id)
    )))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A personalised ticket whose RSA envelope is `envelope`.
    pub fn personalized_ticket(rights_id: [u8; 0x10], envelope: [u8; 0x100]) -> Ticket {
        let mut issuer = [0u8; 0x40];
        let s = b"Root-CA00000003-XS00000024";
        issuer[..s.len()].copy_from_slice(s);

        Ticket {
            sig_type: SigType::Rsa2048Sha256,
            signature: vec![0xAB; SigType::Rsa2048Sha256.signature_size()],
            common: TicketCommonBlock {
                issuer,
                titlekey_block: envelope,
                format_version: TICKET_FORMAT_VERSION,
                titlekey_type: TITLEKEY_TYPE_PERSONALIZED,
                ticket_version: 2,
                license_type: 0,
                common_key_id: 0,
                property_mask: 0,
                _reserved: [0; 8],
                ticket_id: 0x1122334455667788,
                device_id: 0x99AABBCCDDEEFF00,
                rights_id,
                account_id: 0xDEADBEEF,
                sect_total_size: 0x40,
                sect_hdr_offset: 0x2C0,
                sect_hdr_count: 1,
                sect_hdr_entry_size: 0x40,
            },
            section_records: vec![0x5A; 0x40],
        }
    }

    /// Oracle that decrypts the test envelope by truncation and serves a
    /// fixed titlekek.
    pub struct TestOracle {
        pub titlekek: [u8; 0x10],
        pub titlekey: [u8; 0x10],
    }

    impl crate::keys::KeyOracle for TestOracle {
        fn header_key(&self) -> Option<[u8; 0x20]> {
            None
        }

        fn key_area_key(
            &self,
            _generation: u8,
            _index: crate::keys::KeyAreaKeyIndex,
        ) -> Option<[u8; 0x10]> {
            None
        }

        fn titlekey_for_rights_id(&self, _rights_id: &[u8; 0x10]) -> Option<[u8; 0x10]> {
            None
        }

        fn common_titlekek(&self, generation: u8) -> Option<[u8; 0x10]> {
            (generation == 0).then_some(self.titlekek)
        }

        fn rsa_oaep_decrypt_titlekey(&self, _enc: &[u8; 0x100]) -> Option<[u8; 0x10]> {
            Some(self.titlekey)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::keys::title_keys::decrypt_titlekey_block;

    #[test]
    fn test_parse_round_trip() {
        let tik = personalized_ticket([0x33; 0x10], [0x44; 0x100]);
        let bytes = tik.to_bytes().unwrap();
        // 4 (type) + 0x13C (sig) + 0x180 (common) + 0x40 (sections)
        assert_eq!(bytes.len(), 4 + 0x13C + 0x180 + 0x40);

        let parsed = Ticket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sig_type, SigType::Rsa2048Sha256);
        assert_eq!(parsed.common.rights_id, [0x33; 0x10]);
        assert_eq!(parsed.issuer_str(), "Root-CA00000003-XS00000024");
        assert!(parsed.is_valid());
        assert!(parsed.is_personalized());
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_bad_tickets_rejected() {
        assert!(Ticket::from_bytes(&[0u8; 2]).is_err());

        // Unknown signature type.
        let mut bytes = personalized_ticket([1; 0x10], [0; 0x100]).to_bytes().unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(
            Ticket::from_bytes(&bytes),
            Err(Error::InvalidTicket(_))
        ));

        // Wrong format version.
        let mut tik = personalized_ticket([1; 0x10], [0; 0x100]);
        tik.common.format_version = 1;
        let bytes = tik.to_bytes().unwrap();
        assert!(matches!(
            Ticket::from_bytes(&bytes),
            Err(Error::InvalidTicket(_))
        ));
    }

    #[test]
    fn test_personalized_to_common_conversion() {
        let rights_id = [0x77; 0x10];
        let titlekey = [0x5C; 0x10];
        let titlekek = [0x9D; 0x10];
        let oracle = TestOracle { titlekek, titlekey };

        let mut tik = personalized_ticket(rights_id, [0xEE; 0x100]);
        let chain = tik.convert_personalized_to_common(&oracle).unwrap();

        assert!(tik.is_common());
        assert!(tik.is_valid());
        assert_eq!(tik.common.ticket_id, 0);
        assert_eq!(tik.common.device_id, 0);
        assert_eq!(tik.common.account_id, 0);
        assert_eq!(tik.common.sect_hdr_count, 0);
        assert!(tik.section_records.is_empty());
        assert_eq!(tik.issuer_str(), COMMON_TICKET_ISSUER);
        assert!(tik.signature.iter().all(|&b| b == 0));

        // The wrapped titlekey decrypts back to the personalised one.
        let dec = decrypt_titlekey_block(&tik.common_titlekey_block(), &titlekek);
        assert_eq!(dec, titlekey);
        // The rest of the block is zeroed.
        assert!(tik.common.titlekey_block[0x10..].iter().all(|&b| b == 0));

        // Chain: root (0x500) + CA (0x300) + signer (0x300).
        assert_eq!(chain.len(), 0x500 + 0x300 + 0x300);

        // Converting twice fails: it is no longer personalised.
        assert!(tik.convert_personalized_to_common(&oracle).is_err());
    }

    #[test]
    fn test_chain_synthesis_issuers() {
        assert!(synthesize_certificate_chain("Root-CA00000003-XS00000020").is_ok());
        assert!(synthesize_certificate_chain("Root-CA00000004-XS00000021").is_ok());
        assert!(synthesize_certificate_chain("Bogus-CA00000003-XS00000020").is_err());
        assert!(synthesize_certificate_chain("Root-CA99999999-XS00000020").is_err());
        assert!(synthesize_certificate_chain("Root").is_err());
    }

    #[test]
    fn test_gamecard_chain_selection() {
        let rights_a = [0xAA; 0x10];
        let rights_b = [0xBB; 0x10];
        let chain_b = vec![0xB0u8; 0x600];

        let mut area = vec![0u8; GAMECARD_CERT_RECORD_SIZE * 2];
        area[..0x10].copy_from_slice(&rights_a);
        area[0x10..0x14].copy_from_slice(&4u32.to_le_bytes());
        area[0x20..0x24].copy_from_slice(&[1, 2, 3, 4]);

        let slot_b = GAMECARD_CERT_RECORD_SIZE;
        area[slot_b..slot_b + 0x10].copy_from_slice(&rights_b);
        area[slot_b + 0x10..slot_b + 0x14]
            .copy_from_slice(&(chain_b.len() as u32).to_le_bytes());
        area[slot_b + 0x20..slot_b + 0x20 + chain_b.len()].copy_from_slice(&chain_b);

        assert_eq!(select_gamecard_chain(&area, &rights_a).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(select_gamecard_chain(&area, &rights_b).unwrap(), chain_b);
        assert!(matches!(
            select_gamecard_chain(&area, &[0xCC; 0x10]),
            Err(Error::NotFound(_))
        ));
    }
}
