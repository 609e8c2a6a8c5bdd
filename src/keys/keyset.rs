use aes::Aes128;
use cipher::{KeyInit, generic_array::GenericArray};
use hex::FromHex;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Result, Seek};
use std::path::Path;
use xts_mode::Xts128;

#[derive(Clone, Default)]
pub struct Keyset {
    // Raw storage for all keys
    pub raw_keys: HashMap<String, Vec<u8>>,

    // Keep cached versions of frequently accessed keys for performance
    pub header_key_cache: Option<[u8; 0x20]>,
}

impl fmt::Debug for Keyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material; counts only.
        f.debug_struct("Keyset")
            .field("total_keys", &self.raw_keys.len())
            .field("has_header_key", &self.header_key_cache.is_some())
            .finish()
    }
}

impl Keyset {
    /// Create a new keyset from a file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    /// Parse a key file to extract Nintendo Switch keys
    pub fn from_reader(reader: impl Read + Seek) -> Result<Self> {
        let lines = BufReader::new(reader).lines();
        let mut keyset = Keyset::default();
        let mut keys_loaded = 0;

        for line in lines {
            let line_str = line?;

            // Skip empty lines or comments
            if line_str.trim().is_empty() || line_str.trim().starts_with(';') {
                continue;
            }

            let line_parts: Vec<_> = line_str.split('=').collect();
            if line_parts.len() != 2 {
                continue;
            }

            let key = line_parts[0].trim().to_string();
            let value = line_parts[1].trim().split(';').next().unwrap_or("").trim();

            let key_data = match Vec::from_hex(value) {
                Ok(data) => data,
                Err(_) => {
                    tracing::warn!("Invalid hex value for key {}", key);
                    continue;
                }
            };

            keyset.raw_keys.insert(key, key_data);
            keys_loaded += 1;
        }

        keyset.update_caches();

        tracing::info!("Loaded {} keys", keys_loaded);

        Ok(keyset)
    }

    /// Update internal caches for frequently accessed keys
    fn update_caches(&mut self) {
        if let Some(key_data) = self.raw_keys.get("header_key") {
            if key_data.len() == 0x20 {
                let mut header_key = [0u8; 0x20];
                header_key.copy_from_slice(key_data);
                self.header_key_cache = Some(header_key);
            }
        }
    }

    /// Creates an XTS128 cipher for NCA header encryption/decryption
    ///
    /// The header key is split into two 128-bit keys for XTS, with the first half used for the data unit key
    /// and the second half used for the tweak key.
    pub fn header_crypt(&self) -> Option<Xts128<Aes128>> {
        self.header_key_cache.map(|header_key| {
            let cipher_1 = Aes128::new(GenericArray::from_slice(&header_key[..0x10]));
            let cipher_2 = Aes128::new(GenericArray::from_slice(&header_key[0x10..]));
            Xts128::new(cipher_1, cipher_2)
        })
    }

    /// Try to get a fixed-size key by its exact name
    pub fn get_key<const N: usize>(&self, key_name: &str) -> Option<[u8; N]> {
        self.raw_keys.get(key_name).and_then(|data| {
            if data.len() == N {
                let mut result = [0u8; N];
                result.copy_from_slice(data);
                Some(result)
            } else {
                None
            }
        })
    }

    /// Get the header key (cached for performance)
    pub fn header_key(&self) -> Option<&[u8; 0x20]> {
        self.header_key_cache.as_ref()
    }

    /// Get an application key area key by index
    pub fn get_key_area_key_application(&self, idx: usize) -> Option<[u8; 0x10]> {
        let key_name = format!("key_area_key_application_{:02x}", idx as u8);
        self.get_key(&key_name)
    }

    /// Get an ocean key area key by index
    pub fn get_key_area_key_ocean(&self, idx: usize) -> Option<[u8; 0x10]> {
        let key_name = format!("key_area_key_ocean_{:02x}", idx as u8);
        self.get_key(&key_name)
    }

    /// Get a system key area key by index
    pub fn get_key_area_key_system(&self, idx: usize) -> Option<[u8; 0x10]> {
        let key_name = format!("key_area_key_system_{:02x}", idx as u8);
        self.get_key(&key_name)
    }

    /// Get the title KEK for the specified key generation
    pub fn get_title_kek(&self, key_generation: usize) -> Option<[u8; 0x10]> {
        let key_name = format!("titlekek_{:02x}", key_generation as u8);
        self.get_key(&key_name)
    }

    /// Check if the keyset has the necessary keys for NCA decryption
    pub fn has_required_nca_keys(&self) -> bool {
        self.header_key_cache.is_some() && self.get_key_area_key_application(0).is_some()
    }
}
