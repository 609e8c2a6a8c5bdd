//! Key material access for NCA and ticket crypto.
//!
//! The dump pipeline never owns console key material; it goes through the
//! [`KeyOracle`] trait. [`Keyset`] (prod.keys-style files) plus an optional
//! [`TitleKeys`] database form the stock implementation via [`KeyStore`].

pub mod keyset;
pub mod title_keys;

pub use keyset::Keyset;
pub use title_keys::TitleKeys;

/// Selects which key-area encryption key decrypts an NCA key area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAreaKeyIndex {
    Application = 0,
    Ocean = 1,
    System = 2,
}

/// Narrow key-lookup interface consumed by the content-archive engine.
///
/// Signature verification keys are deliberately absent; signatures are not
/// enforced here. `rsa_oaep_decrypt_titlekey` is only reachable from
/// personalised-ticket conversion and may be unimplemented (`None`) when no
/// console private key is available.
pub trait KeyOracle {
    /// AES-128-XTS header key (two concatenated 128-bit halves).
    fn header_key(&self) -> Option<[u8; 0x20]>;

    /// AES-128-ECB key-area key for a key generation and key-area index.
    fn key_area_key(&self, generation: u8, index: KeyAreaKeyIndex) -> Option<[u8; 0x10]>;

    /// Encrypted titlekey registered for a rights ID, if any.
    fn titlekey_for_rights_id(&self, rights_id: &[u8; 0x10]) -> Option<[u8; 0x10]>;

    /// Common titlekey encryption key (titlekek) for a key generation.
    fn common_titlekek(&self, generation: u8) -> Option<[u8; 0x10]>;

    /// Decrypts an RSA-2048-OAEP personalised titlekey envelope.
    fn rsa_oaep_decrypt_titlekey(&self, _enc: &[u8; 0x100]) -> Option<[u8; 0x10]> {
        None
    }
}

/// Stock [`KeyOracle`] over a parsed [`Keyset`] and titlekey database.
pub struct KeyStore<'a> {
    pub keyset: &'a Keyset,
    pub title_keys: Option<&'a TitleKeys>,
}

impl KeyOracle for KeyStore<'_> {
    fn header_key(&self) -> Option<[u8; 0x20]> {
        self.keyset.header_key().copied()
    }

    fn key_area_key(&self, generation: u8, index: KeyAreaKeyIndex) -> Option<[u8; 0x10]> {
        match index {
            KeyAreaKeyIndex::Application => {
                self.keyset.get_key_area_key_application(generation as usize)
            }
            KeyAreaKeyIndex::Ocean => self.keyset.get_key_area_key_ocean(generation as usize),
            KeyAreaKeyIndex::System => self.keyset.get_key_area_key_system(generation as usize),
        }
    }

    fn titlekey_for_rights_id(&self, rights_id: &[u8; 0x10]) -> Option<[u8; 0x10]> {
        let rights_id_hex = hex::encode(rights_id).to_uppercase();
        self.title_keys
            .and_then(|db| db.get_title_key(&rights_id_hex))
            .and_then(|key| key.as_slice().try_into().ok())
    }

    fn common_titlekek(&self, generation: u8) -> Option<[u8; 0x10]> {
        self.keyset.get_title_kek(generation as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_store_lookups() {
        let keys = r#"
        header_key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
        key_area_key_application_00 = 2b7e151628aed2a6abf7158809cf4f3c
        key_area_key_ocean_00 = 3b7e151628aed2a6abf7158809cf4f3c
        titlekek_00 = 603deb1015ca71be2b73aef0857d7781
        "#;
        let keyset = Keyset::from_reader(std::io::Cursor::new(keys)).unwrap();

        let mut title_keys = TitleKeys::new();
        let rights_id = [0xABu8; 0x10];
        title_keys.add_title_key(&hex::encode(rights_id), vec![0x42; 0x10]);

        let store = KeyStore {
            keyset: &keyset,
            title_keys: Some(&title_keys),
        };

        assert!(store.header_key().is_some());
        assert!(store.key_area_key(0, KeyAreaKeyIndex::Application).is_some());
        assert!(store.key_area_key(0, KeyAreaKeyIndex::Ocean).is_some());
        assert!(store.key_area_key(0, KeyAreaKeyIndex::System).is_none());
        assert!(store.key_area_key(1, KeyAreaKeyIndex::Application).is_none());
        assert_eq!(store.titlekey_for_rights_id(&rights_id), Some([0x42; 0x10]));
        assert_eq!(store.titlekey_for_rights_id(&[0; 0x10]), None);
        assert!(store.common_titlekek(0).is_some());
        // No console key: the OAEP hook stays unimplemented.
        assert_eq!(store.rsa_oaep_decrypt_titlekey(&[0; 0x100]), None);
    }
}
