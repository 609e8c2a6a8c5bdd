//! USB host sink: the NXDT length-prefixed command protocol.
//!
//! Every command is a 16-byte little-endian header (`NXDT` magic, command
//! ID, command block size) followed by the command block; the host answers
//! with a 16-byte status. File data travels on the bulk endpoint after a
//! `SendFileProperties` exchange, in chunks of at most 8 MiB, with a
//! zero-length termination packet when the final chunk is an exact
//! multiple of the host endpoint's max packet size.
//!
//! NSP mode: a `SendFileProperties` with a non-zero `nsp_header_size`
//! opens the output file with that much space reserved; each NSP entry
//! then arrives as its own `SendFileProperties` (header size zero), and a
//! final `SendNspHeader` delivers the back-patched partition header.
//!
//! The transport itself (endpoints, timeouts) is external; this module
//! only frames commands over a [`UsbTransport`].

use binrw::prelude::*;

use crate::dump::sink::Sink;
use crate::error::Error;

pub const USB_MAGIC: [u8; 4] = *b"NXDT";
/// Largest bulk data chunk.
pub const USB_TRANSFER_BLOCK_SIZE: usize = 0x800000;
/// Current ABI version of the command set.
pub const USB_ABI_VERSION: u8 = 1;
/// Fixed filename field length inside SendFileProperties.
pub const USB_FILE_NAME_LENGTH: usize = 0x301;

pub const USB_CMD_START_SESSION: u32 = 0;
pub const USB_CMD_SEND_FILE_PROPERTIES: u32 = 1;
pub const USB_CMD_CANCEL_FILE_TRANSFER: u32 = 2;
pub const USB_CMD_SEND_NSP_HEADER: u32 = 3;
pub const USB_CMD_END_SESSION: u32 = 4;
pub const USB_CMD_START_EXTRACTED_FS_DUMP: u32 = 5;
pub const USB_CMD_END_EXTRACTED_FS_DUMP: u32 = 6;

pub const USB_STATUS_SUCCESS: u32 = 0;
pub const USB_STATUS_INVALID_MAGIC: u32 = 4;
pub const USB_STATUS_UNSUPPORTED_COMMAND: u32 = 5;
pub const USB_STATUS_UNSUPPORTED_ABI_VERSION: u32 = 6;
pub const USB_STATUS_MALFORMED_COMMAND: u32 = 7;
pub const USB_STATUS_HOST_IO_ERROR: u32 = 8;

/// Raw transport over the bulk endpoints. Implementations enforce the
/// 5-second per-operation timeout and surface failures as `SinkIoError`.
pub trait UsbTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), Error>;
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct UsbCommandHeader {
    pub magic: [u8; 4],
    pub command_id: u32,
    pub command_block_size: u32,
    pub _reserved: [u8; 4],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct UsbStatus {
    pub magic: [u8; 4],
    pub status: u32,
    pub max_packet_size: u16,
    pub _reserved: [u8; 6],
}

#[binrw]
#[brw(little)]
struct StartSessionBlock {
    app_ver_major: u8,
    app_ver_minor: u8,
    app_ver_micro: u8,
    abi_version: u8,
    git_commit: [u8; 8],
    _reserved: [u8; 4],
}

/// Serialised SendFileProperties block size (fields + name + padding).
const FILE_PROPERTIES_BLOCK_SIZE: usize = 0x320;

fn build_file_properties_block(
    file_size: u64,
    filename: &str,
    nsp_header_size: u32,
) -> Result<Vec<u8>, Error> {
    if filename.len() >= USB_FILE_NAME_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "file name too long ({} bytes)",
            filename.len()
        )));
    }
    let mut block = Vec::with_capacity(FILE_PROPERTIES_BLOCK_SIZE);
    block.extend_from_slice(&file_size.to_le_bytes());
    block.extend_from_slice(&(filename.len() as u32).to_le_bytes());
    block.extend_from_slice(&nsp_header_size.to_le_bytes());
    block.extend_from_slice(filename.as_bytes());
    block.resize(FILE_PROPERTIES_BLOCK_SIZE, 0);
    Ok(block)
}

/// USB host sink speaking the NXDT protocol over a [`UsbTransport`].
pub struct UsbSink<T: UsbTransport> {
    transport: T,
    /// Host endpoint max packet size, learnt at session start.
    max_packet_size: u16,
    session_open: bool,
    file_open: bool,
    nsp_mode: bool,
    /// Bytes still expected for the currently announced payload (the file
    /// itself, or the current NSP entry).
    entry_remaining: u64,
    entry_size: u64,
}

impl<T: UsbTransport> UsbSink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            max_packet_size: 0,
            session_open: false,
            file_open: false,
            nsp_mode: false,
            entry_remaining: 0,
            entry_size: 0,
        }
    }

    fn send_command(&mut self, command_id: u32, block: &[u8]) -> Result<UsbStatus, Error> {
        let header = UsbCommandHeader {
            magic: USB_MAGIC,
            command_id,
            command_block_size: block.len() as u32,
            _reserved: [0; 4],
        };
        let mut frame = binrw::io::Cursor::new(Vec::with_capacity(0x10 + block.len()));
        header.write_le(&mut frame).map_err(Error::from)?;
        let mut frame = frame.into_inner();
        frame.extend_from_slice(block);

        self.transport.send(&frame)?;

        let mut reply = [0u8; 0x10];
        let n = self.transport.receive(&mut reply)?;
        if n != reply.len() {
            return Err(Error::SinkIoError(format!(
                "short status reply ({} bytes)",
                n
            )));
        }
        let status: UsbStatus = binrw::io::Cursor::new(&reply).read_le()?;

        if status.magic != USB_MAGIC {
            return Err(Error::SinkIoError("status reply carries bad magic".into()));
        }
        match status.status {
            USB_STATUS_SUCCESS => Ok(status),
            USB_STATUS_HOST_IO_ERROR => Err(Error::SinkIoError("host reported IO error".into())),
            USB_STATUS_UNSUPPORTED_ABI_VERSION => {
                Err(Error::SinkUnavailable("host rejected ABI version".into()))
            }
            other => Err(Error::SinkIoError(format!(
                "host rejected command {} with status {}",
                command_id, other
            ))),
        }
    }

    /// ABI handshake; must precede any transfer.
    pub fn start_session(
        &mut self,
        version: (u8, u8, u8),
        git_commit: &str,
    ) -> Result<(), Error> {
        let mut commit = [0u8; 8];
        let bytes = git_commit.as_bytes();
        let n = bytes.len().min(8);
        commit[..n].copy_from_slice(&bytes[..n]);

        let block = {
            let mut cursor = binrw::io::Cursor::new(Vec::new());
            StartSessionBlock {
                app_ver_major: version.0,
                app_ver_minor: version.1,
                app_ver_micro: version.2,
                abi_version: USB_ABI_VERSION,
                git_commit: commit,
                _reserved: [0; 4],
            }
            .write_le(&mut cursor)
            .map_err(Error::from)?;
            cursor.into_inner()
        };

        let status = self.send_command(USB_CMD_START_SESSION, &block)?;
        self.max_packet_size = status.max_packet_size;
        self.session_open = true;
        tracing::trace!(mps = status.max_packet_size, "USB session established");
        Ok(())
    }

    pub fn end_session(&mut self) -> Result<(), Error> {
        if self.session_open {
            self.send_command(USB_CMD_END_SESSION, &[])?;
            self.session_open = false;
        }
        Ok(())
    }

    /// Announces an extracted-FS dump: the cumulative size and logical
    /// root path; individual files follow as normal file transfers.
    pub fn start_extracted_fs_dump(
        &mut self,
        total_size: u64,
        root_path: &str,
    ) -> Result<(), Error> {
        let mut block = Vec::new();
        block.extend_from_slice(&total_size.to_le_bytes());
        block.extend_from_slice(root_path.as_bytes());
        block.push(0);
        self.send_command(USB_CMD_START_EXTRACTED_FS_DUMP, &block)?;
        Ok(())
    }

    pub fn end_extracted_fs_dump(&mut self) -> Result<(), Error> {
        self.send_command(USB_CMD_END_EXTRACTED_FS_DUMP, &[])?;
        Ok(())
    }

    fn ensure_session(&self) -> Result<(), Error> {
        if !self.session_open {
            return Err(Error::SinkUnavailable("no USB session established".into()));
        }
        Ok(())
    }

    /// ZLT rule: a payload whose final chunk lands exactly on the endpoint
    /// max packet size needs a zero-length packet terminator.
    fn needs_zlt(&self) -> bool {
        self.max_packet_size != 0
            && self.entry_size > 0
            && self.entry_size % self.max_packet_size as u64 == 0
    }
}

impl<T: UsbTransport> Sink for UsbSink<T> {
    fn begin_file(
        &mut self,
        name: &str,
        total_size: u64,
        header_reserve_size: u32,
    ) -> Result<(), Error> {
        self.ensure_session()?;
        if self.file_open {
            return Err(Error::InvalidState("previous file still open".into()));
        }

        let block = build_file_properties_block(total_size, name, header_reserve_size)?;
        self.send_command(USB_CMD_SEND_FILE_PROPERTIES, &block)?;

        self.file_open = true;
        if header_reserve_size > 0 {
            // NSP mode: the host reserves the header region and expects
            // per-entry SendFileProperties to follow into the same file.
            self.nsp_mode = true;
            self.entry_remaining = 0;
            self.entry_size = 0;
        } else {
            self.entry_remaining = total_size;
            self.entry_size = total_size;
        }
        Ok(())
    }

    fn begin_entry(&mut self, name: &str, size: u64) -> Result<(), Error> {
        if !self.nsp_mode {
            return Ok(());
        }
        let block = build_file_properties_block(size, name, 0)?;
        self.send_command(USB_CMD_SEND_FILE_PROPERTIES, &block)?;
        self.entry_remaining = size;
        self.entry_size = size;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        if !self.file_open {
            return Err(Error::InvalidState("no file open".into()));
        }
        if buf.len() as u64 > self.entry_remaining {
            return Err(Error::InvalidArgument("write past announced size".into()));
        }

        for chunk in buf.chunks(USB_TRANSFER_BLOCK_SIZE) {
            self.transport.send(chunk)?;
        }
        self.entry_remaining -= buf.len() as u64;

        if self.entry_remaining == 0 && self.needs_zlt() {
            self.transport.send(&[])?;
        }
        Ok(())
    }

    fn end_file(&mut self) -> Result<(), Error> {
        if !self.file_open {
            return Err(Error::InvalidState("no file open".into()));
        }
        // NSP mode stays open until the header arrives.
        if !self.nsp_mode {
            self.file_open = false;
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), Error> {
        if self.file_open || self.nsp_mode {
            self.send_command(USB_CMD_CANCEL_FILE_TRANSFER, &[])?;
            self.file_open = false;
            self.nsp_mode = false;
            self.entry_remaining = 0;
        }
        Ok(())
    }

    fn rewind_and_write_header(&mut self, header: &[u8]) -> Result<(), Error> {
        if !self.nsp_mode {
            return Err(Error::InvalidState("not in NSP transfer mode".into()));
        }
        self.send_command(USB_CMD_SEND_NSP_HEADER, header)?;
        self.nsp_mode = false;
        self.file_open = false;
        Ok(())
    }
}
