use aes::Aes128;
use cipher::KeyIvInit;
use cipher::StreamCipher;
use std::io::{Read, Result, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

/// Function to align down to a power-of-two boundary for AES operations
pub const fn align_down(value: u64, align: u64) -> u64 {
    let inv_mask = align - 1;
    value & !inv_mask
}

/// Function to align up to a power-of-two boundary for AES operations
pub const fn align_up(value: u64, align: u64) -> u64 {
    let inv_mask = align - 1;
    (value + inv_mask) & !inv_mask
}

/// Returns a tweak suitable for Nintendo crypto operations
///
/// The tweak is the sector index in big-endian.
pub fn get_nintendo_tweak(sector_index: u128) -> [u8; 0x10] {
    sector_index.to_be_bytes()
}

/// Trait that combines Read and Seek
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Applies the AES-128-CTR keystream to `buf` in place.
///
/// `offset` is the absolute byte offset of `buf` within the encrypted
/// content and must be 0x10-aligned. The IV packs the section nonce seed in
/// the high half and the block counter (offset >> 4) in the low half.
pub fn apply_aes_ctr(key: &[u8; 0x10], nonce_seed: u64, offset: u64, buf: &mut [u8]) {
    debug_assert_eq!(offset % 0x10, 0);
    let iv = get_nintendo_tweak(((nonce_seed as u128) << 64) | ((offset as u128) >> 4));
    let mut ctr = ctr::Ctr128BE::<Aes128>::new(key.into(), (&iv).into());
    ctr.apply_keystream(buf);
}

/// AES-CTR-Ex variant used by patched-RomFS reads.
///
/// The per-range generation counter replaces the upper 32 bits of the nonce
/// seed before the IV is built.
pub fn apply_aes_ctr_ex(
    key: &[u8; 0x10],
    nonce_seed: u64,
    generation: u32,
    offset: u64,
    buf: &mut [u8],
) {
    let mixed = (nonce_seed & 0x0000_0000_FFFF_FFFF) | ((generation as u64) << 32);
    apply_aes_ctr(key, mixed, offset, buf);
}

/// A shared reader that can be used by multiple consumers
#[derive(Debug)]
pub struct SharedReader<R: Read + Seek> {
    inner: Arc<Mutex<R>>,
}

impl<R: Read + Seek> Clone for SharedReader<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Read + Seek> SharedReader<R> {
    /// Create a new SharedReader
    pub fn new(reader: R) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reader)),
        }
    }

    /// Create a SubFile from this shared reader
    pub fn sub_file(&self, start: u64, end: u64) -> SubFile<Self> {
        SubFile::new(self.clone(), start, end)
    }

    /// Read exactly `buf.len()` bytes at the given absolute offset.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.seek(SeekFrom::Start(offset))?;
        inner.read_exact(buf)
    }
}

impl<R: Read + Seek> Read for SharedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.lock().unwrap().read(buf)
    }
}

impl<R: Read + Seek> Seek for SharedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.inner.lock().unwrap().seek(pos)
    }
}

/// Represents a sub-section of a file
pub struct SubFile<R: Read + Seek> {
    reader: R,
    start: u64,
    end: u64,
    position: u64,
}

impl<R: Read + Seek> SubFile<R> {
    pub fn new(reader: R, start: u64, end: u64) -> Self {
        Self {
            reader,
            start,
            end,
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

impl<R: Read + Seek> Read for SubFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.start == self.end || self.position >= self.end - self.start {
            return Ok(0);
        }

        self.reader
            .seek(SeekFrom::Start(self.start + self.position))?;

        let max_read =
            std::cmp::min(buf.len() as u64, (self.end - self.start) - self.position) as usize;
        let bytes_read: usize = self.reader.read(&mut buf[..max_read])?;

        self.position += bytes_read as u64;
        Ok(bytes_read)
    }
}

impl<R: Read + Seek> Seek for SubFile<R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(offset) => ((self.end - self.start) as i64 + offset) as u64,
            SeekFrom::Current(offset) => (self.position as i64 + offset) as u64,
        };

        if new_pos > self.end - self.start {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Cannot seek past end of subfile",
            ));
        }

        self.position = new_pos;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_aes_ctr_round_trip() {
        let key = [0x13u8; 0x10];
        let seed = 0xDEADBEEF_u64;

        let plain = b"0123456789ABCDEF0123456789ABCDEF".to_vec();
        let mut encrypted = plain.clone();
        apply_aes_ctr(&key, seed, 0x40, &mut encrypted);
        assert_ne!(encrypted, plain);

        apply_aes_ctr(&key, seed, 0x40, &mut encrypted);
        assert_eq!(encrypted, plain);
    }

    #[test]
    fn test_aes_ctr_offset_continuity() {
        // Decrypting two halves separately must match one full-range pass.
        let key = [0x77u8; 0x10];
        let seed = 42;
        let mut whole = vec![0xA5u8; 0x40];
        apply_aes_ctr(&key, seed, 0x100, &mut whole);

        let mut first = vec![0xA5u8; 0x20];
        let mut second = vec![0xA5u8; 0x20];
        apply_aes_ctr(&key, seed, 0x100, &mut first);
        apply_aes_ctr(&key, seed, 0x120, &mut second);

        assert_eq!(&whole[..0x20], &first[..]);
        assert_eq!(&whole[0x20..], &second[..]);
    }

    #[test]
    fn test_aes_ctr_ex_generation_changes_keystream() {
        let key = [0x01u8; 0x10];
        let mut a = vec![0u8; 0x10];
        let mut b = vec![0u8; 0x10];
        apply_aes_ctr_ex(&key, 0, 1, 0, &mut a);
        apply_aes_ctr_ex(&key, 0, 2, 0, &mut b);
        assert_ne!(a, b);

        // Generation 0 degenerates to the plain CTR keystream.
        let mut c = vec![0u8; 0x10];
        let mut d = vec![0u8; 0x10];
        apply_aes_ctr_ex(&key, 0, 0, 0, &mut c);
        apply_aes_ctr(&key, 0, 0, &mut d);
        assert_eq!(c, d);
    }

    #[test]
    fn test_sub_file_bounds() {
        let data: Vec<u8> = (0..0x40u8).collect();
        let shared = SharedReader::new(Cursor::new(data));
        let mut sub = shared.sub_file(0x10, 0x20);

        let mut buf = [0u8; 0x20];
        let n = sub.read(&mut buf).unwrap();
        assert_eq!(n, 0x10);
        assert_eq!(&buf[..0x10], &(0x10..0x20u8).collect::<Vec<_>>()[..]);
        assert_eq!(sub.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_nintendo_tweak_generation() {
        let sector = 0x01020304_u128;
        let tweak = get_nintendo_tweak(sector);
        let expected = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02,
            0x03, 0x04,
        ];
        assert_eq!(tweak.as_slice(), &expected);
    }
}
