use super::NcaHeader;
use super::types::*;
use crate::error::Error;
use crate::keys::{Keyset, TitleKeys};

/// Per-NCA decrypted key material.
///
/// Built once at context initialisation: either the titlekey path (non-zero
/// rights ID) or the key-area path. A failed lookup does not abort parsing;
/// it clears `key_status` so section reads can fail lazily with a precise
/// error.
#[derive(Debug)]
pub struct NcaKeyManagement {
    dec_title_key: Option<[u8; 0x10]>,
    dec_key_area: KeyArea,
    key_status: bool,
}

impl NcaKeyManagement {
    pub fn new(
        header: &NcaHeader,
        keyset: &Keyset,
        title_keys: Option<&TitleKeys>,
    ) -> Result<Self, Error> {
        let mut dec_key_area = KeyArea::default();
        let mut key_status = true;

        let dec_title_key = if !header.rights_id.iter().all(|&b| b == 0) {
            Self::process_title_key(header, keyset, title_keys, &mut key_status)?
        } else {
            Self::process_key_area(header, keyset, &mut dec_key_area, &mut key_status)?;
            None
        };

        Ok(Self {
            dec_title_key,
            dec_key_area,
            key_status,
        })
    }

    fn process_title_key(
        header: &NcaHeader,
        keyset: &Keyset,
        title_keys: Option<&TitleKeys>,
        key_status: &mut bool,
    ) -> Result<Option<[u8; 0x10]>, Error> {
        let rights_id_hex = hex::encode(header.rights_id).to_uppercase();
        tracing::trace!(rights_id = %rights_id_hex, "NCA requires title key");

        let key_gen = header.get_key_generation();

        if let Some(title_keys_db) = title_keys {
            if let Some(title_kek) = keyset.get_title_kek(key_gen as usize) {
                match title_keys_db.decrypt_title_key(&rights_id_hex, &title_kek) {
                    Ok(dec_key) => Ok(Some(dec_key)),
                    Err(e) => {
                        tracing::warn!("Failed to decrypt title key: {}", e);
                        *key_status = false;
                        Ok(None)
                    }
                }
            } else {
                tracing::warn!(
                    "Title key encryption key not present for key generation {}",
                    key_gen
                );
                *key_status = false;
                Ok(None)
            }
        } else {
            tracing::warn!("NCA requires title key but no title keys database was supplied");
            *key_status = false;
            Ok(None)
        }
    }

    fn process_key_area(
        header: &NcaHeader,
        keyset: &Keyset,
        dec_key_area: &mut KeyArea,
        key_status: &mut bool,
    ) -> Result<(), Error> {
        tracing::trace!("NCA does not require title key, attempting to get key area key");
        let key_gen = header.get_key_generation();

        let key_area_key = match header.key_area_appkey_index {
            KeyAreaEncryptionKeyIndex::Application => {
                keyset.get_key_area_key_application(key_gen as usize)
            }
            KeyAreaEncryptionKeyIndex::Ocean => keyset.get_key_area_key_ocean(key_gen as usize),
            KeyAreaEncryptionKeyIndex::System => keyset.get_key_area_key_system(key_gen as usize),
        };

        if let Some(key) = key_area_key {
            use cipher::BlockDecryptMut;
            use cipher::KeyInit;

            type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

            let mut decryptor = Aes128EcbDec::new_from_slice(&key)
                .map_err(|_| Error::CryptoError("Failed to create ECB decryptor".to_string()))?;

            // The key area is 0x40 bytes: 4 AES blocks, no padding concerns.
            let mut raw = [0u8; 0x40];
            raw[..0x20].copy_from_slice(&header.encrypted_keys.aes_xts_key);
            raw[0x20..0x30].copy_from_slice(&header.encrypted_keys.aes_ctr_key);
            raw[0x30..].copy_from_slice(&header.encrypted_keys._reserved);

            for chunk in raw.chunks_exact_mut(0x10) {
                decryptor.decrypt_blocks_mut(std::slice::from_mut(aes::Block::from_mut_slice(chunk)));
            }

            dec_key_area.aes_xts_key.copy_from_slice(&raw[..0x20]);
            dec_key_area.aes_ctr_key.copy_from_slice(&raw[0x20..0x30]);
            dec_key_area._reserved.copy_from_slice(&raw[0x30..]);

            Ok(())
        } else {
            tracing::warn!(
                key_type = ?header.key_area_appkey_index,
                key_gen = %key_gen,
                "Key area key not present"
            );
            *key_status = false;
            Ok(())
        }
    }

    pub fn has_valid_keys(&self) -> bool {
        self.key_status
    }

    pub fn titlekey(&self) -> Option<[u8; 0x10]> {
        self.dec_title_key
    }

    pub fn key_area(&self) -> &KeyArea {
        &self.dec_key_area
    }

    /// Resolves the AES-CTR content key: titlekey when a rights ID is set,
    /// the decrypted key-area CTR entry otherwise.
    pub fn get_aes_ctr_decrypt_key(&self, rights_id: &[u8; 0x10]) -> Result<[u8; 0x10], Error> {
        if !rights_id.iter().all(|&b| b == 0) {
            if let Some(dec_key) = self.dec_title_key {
                return Ok(dec_key);
            }

            let rights_id_hex = hex::encode(rights_id).to_uppercase();
            return Err(Error::MissingKey(format!(
                "titlekey for rights ID {} unavailable",
                rights_id_hex
            )));
        }

        if !self.key_status {
            return Err(Error::MissingKey(
                "key area could not be decrypted".to_string(),
            ));
        }

        Ok(self.dec_key_area.aes_ctr_key)
    }
}
