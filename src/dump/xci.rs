//! Whole-gamecard image dumping.
//!
//! Streams a cartridge image to a sink with the preservation options the
//! original cartridge dumps expect: an optional 0x200-byte key-area
//! prepend, certificate scrubbing (the unique cert at 0x7000 is filled
//! with 0xFF unless explicitly kept), trimming to the used area, and
//! CRC-32 checksums over the emitted image.

use crate::dump::sink::Sink;
use crate::dump::stream::{StreamSession, TRANSFER_BLOCK_SIZE, run_transfer};
use crate::error::Error;

/// Card-relative offset of the unique certificate.
pub const GAMECARD_CERT_OFFSET: u64 = 0x7000;
pub const GAMECARD_CERT_SIZE: u64 = 0x200;
/// Size of the prepended key area.
pub const GAMECARD_KEY_AREA_SIZE: u64 = 0x200;

/// The low-level gamecard transport, supplied by the caller.
pub trait GamecardReader {
    /// Full card size in bytes.
    fn total_size(&self) -> u64;
    /// Used-area size (trimmed dumps stop here).
    fn trimmed_size(&self) -> u64;
    /// Reads raw card bytes at a card-relative offset.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;
    /// The 0x200-byte key area, fetched from the gamecard security
    /// service.
    fn key_area(&mut self) -> Result<[u8; GAMECARD_KEY_AREA_SIZE as usize], Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct XciDumpOptions {
    pub prepend_key_area: bool,
    pub keep_certificate: bool,
    pub trim_dump: bool,
    pub calculate_checksum: bool,
}

impl Default for XciDumpOptions {
    fn default() -> Self {
        Self {
            prepend_key_area: false,
            // Scrubbing is an explicit opt-in; a plain dump preserves the
            // unique certificate as read.
            keep_certificate: true,
            trim_dump: false,
            calculate_checksum: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct XciDumpReport {
    pub bytes_written: u64,
    /// CRC-32 over the emitted card image (scrub applied, key area
    /// excluded).
    pub image_crc: Option<u32>,
    /// CRC-32 over the full output when the key area is prepended.
    pub full_crc: Option<u32>,
}

pub fn dump_gamecard<C: GamecardReader + Send>(
    card: &mut C,
    options: XciDumpOptions,
    sink: &mut dyn Sink,
    file_name: &str,
) -> Result<XciDumpReport, Error> {
    dump_gamecard_with_block_size(card, options, sink, file_name, TRANSFER_BLOCK_SIZE)
}

pub fn dump_gamecard_with_block_size<C: GamecardReader + Send>(
    card: &mut C,
    options: XciDumpOptions,
    sink: &mut dyn Sink,
    file_name: &str,
    block_size: usize,
) -> Result<XciDumpReport, Error> {
    let image_size = if options.trim_dump {
        card.trimmed_size()
    } else {
        card.total_size()
    };
    let prepend = if options.prepend_key_area {
        GAMECARD_KEY_AREA_SIZE
    } else {
        0
    };
    let total_size = image_size + prepend;

    let key_area = if options.prepend_key_area {
        Some(card.key_area()?)
    } else {
        None
    };

    sink.begin_file(file_name, total_size, 0)?;

    let mut image_crc = options.calculate_checksum.then(crc32fast::Hasher::new);
    let mut full_crc = (options.calculate_checksum && options.prepend_key_area)
        .then(crc32fast::Hasher::new);

    let session = StreamSession::with_block_size(total_size, block_size);
    let result = run_transfer(
        &session,
        block_size,
        |offset, buf| {
            // Assemble the window: key area first (if prepended), card
            // image after it.
            let mut filled = 0usize;
            if offset < prepend {
                let area = key_area.as_ref().expect("prepend implies key area");
                let n = ((prepend - offset) as usize).min(buf.len());
                buf[..n].copy_from_slice(&area[offset as usize..offset as usize + n]);
                filled = n;
            }
            if filled < buf.len() {
                let card_offset = offset + filled as u64 - prepend;
                card.read(card_offset, &mut buf[filled..])?;
            }

            // Scrub the unique certificate unless it is kept.
            if !options.keep_certificate {
                let cert_start = prepend + GAMECARD_CERT_OFFSET;
                let cert_end = cert_start + GAMECARD_CERT_SIZE;
                let win_end = offset + buf.len() as u64;
                let start = offset.max(cert_start);
                let end = win_end.min(cert_end);
                if start < end {
                    buf[(start - offset) as usize..(end - offset) as usize].fill(0xFF);
                }
            }

            if let Some(crc) = image_crc.as_mut() {
                let skip = if offset < prepend {
                    ((prepend - offset) as usize).min(buf.len())
                } else {
                    0
                };
                crc.update(&buf[skip..]);
            }
            if let Some(crc) = full_crc.as_mut() {
                crc.update(buf);
            }
            Ok(())
        },
        sink,
    );

    let bytes_written = match result {
        Ok(n) => n,
        Err(e) => {
            sink.cancel()?;
            return Err(e);
        }
    };

    sink.end_file()?;

    tracing::info!(
        file_name,
        bytes_written,
        size = %crate::util::format_size(bytes_written),
        "gamecard image dumped"
    );

    Ok(XciDumpReport {
        bytes_written,
        image_crc: image_crc.map(|c| c.finalize()),
        full_crc: full_crc.map(|c| c.finalize()),
    })
}
