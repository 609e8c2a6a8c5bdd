//! Producer/consumer streaming for long transfers.
//!
//! Every long transfer runs as a reader/writer pair over a
//! [`StreamSession`]: two equally-sized buffers, a mutex, and two condition
//! variables. The reader fills a free buffer and publishes it; the writer
//! takes the published buffer, pushes it to the sink, and hands it back.
//! At most one chunk is in flight, so ordering is trivial and a transfer
//! never holds more than two buffers of memory.
//!
//! Cancellation and errors are flags checked at every chunk boundary; the
//! worst-case cancellation latency is one block of work.

use std::sync::{Condvar, Mutex};

use crate::dump::sink::Sink;
use crate::error::Error;

/// Default transfer chunk size (8 MiB).
pub const TRANSFER_BLOCK_SIZE: usize = 0x800000;

#[derive(Debug, Default)]
struct SessionState {
    /// The chunk currently owned by the writer, if any.
    data: Option<Vec<u8>>,
    /// Buffers free for the reader to fill.
    free: Vec<Vec<u8>>,
    data_written: u64,
    read_error: bool,
    write_error: bool,
    transfer_cancelled: bool,
    /// Reader has published everything it will.
    read_finished: bool,
}

/// Shared state of one streaming transfer.
pub struct StreamSession {
    total_size: u64,
    state: Mutex<SessionState>,
    /// Signalled when a buffer returns to the free list (reader waits).
    read_ready: Condvar,
    /// Signalled when a chunk is published (writer waits).
    write_ready: Condvar,
}

impl StreamSession {
    pub fn new(total_size: u64) -> Self {
        Self::with_block_size(total_size, TRANSFER_BLOCK_SIZE)
    }

    pub fn with_block_size(total_size: u64, block_size: usize) -> Self {
        Self {
            total_size,
            state: Mutex::new(SessionState {
                free: vec![Vec::with_capacity(block_size), Vec::with_capacity(block_size)],
                ..Default::default()
            }),
            read_ready: Condvar::new(),
            write_ready: Condvar::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn data_written(&self) -> u64 {
        self.state.lock().unwrap().data_written
    }

    /// Requests cooperative cancellation. Both sides notice at their next
    /// chunk boundary.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.transfer_cancelled = true;
        self.read_ready.notify_all();
        self.write_ready.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().transfer_cancelled
    }

    fn set_read_error(&self) {
        let mut state = self.state.lock().unwrap();
        state.read_error = true;
        self.write_ready.notify_all();
    }

    fn set_write_error(&self) {
        let mut state = self.state.lock().unwrap();
        state.write_error = true;
        self.read_ready.notify_all();
    }

    fn finish_reading(&self) {
        let mut state = self.state.lock().unwrap();
        state.read_finished = true;
        self.write_ready.notify_all();
    }

    /// Reader: obtains a free buffer, waiting for the writer if both are
    /// in flight.
    fn acquire_buffer(&self) -> Result<Vec<u8>, Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.transfer_cancelled {
                return Err(Error::Cancelled);
            }
            if state.write_error {
                return Err(Error::SinkIoError("writer failed".into()));
            }
            if let Some(buf) = state.free.pop() {
                return Ok(buf);
            }
            state = self.read_ready.wait(state).unwrap();
        }
    }

    /// Reader: publishes a filled chunk to the writer.
    fn publish(&self, buf: Vec<u8>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.transfer_cancelled {
                return Err(Error::Cancelled);
            }
            if state.write_error {
                return Err(Error::SinkIoError("writer failed".into()));
            }
            if state.data.is_none() {
                state.data = Some(buf);
                self.write_ready.notify_one();
                return Ok(());
            }
            state = self.read_ready.wait(state).unwrap();
        }
    }

    /// Writer: takes the next published chunk. `None` means the reader is
    /// done and everything published has been consumed.
    fn next_chunk(&self) -> Result<Option<Vec<u8>>, Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.transfer_cancelled {
                return Err(Error::Cancelled);
            }
            if let Some(buf) = state.data.take() {
                return Ok(Some(buf));
            }
            if state.read_error {
                return Err(Error::InvalidState("reader failed".into()));
            }
            if state.read_finished {
                return Ok(None);
            }
            state = self.write_ready.wait(state).unwrap();
        }
    }

    /// Writer: accounts a fully-written chunk and recycles its buffer.
    fn complete_chunk(&self, mut buf: Vec<u8>) {
        let written = buf.len() as u64;
        buf.clear();
        let mut state = self.state.lock().unwrap();
        state.data_written += written;
        state.free.push(buf);
        self.read_ready.notify_one();
    }
}

/// Drives one transfer: a reader fiber produced from `fill`, the calling
/// thread as the writer. `fill(offset, buf)` must fill the whole buffer
/// with source bytes at `offset`.
///
/// Returns the byte count delivered to the sink, which equals the session
/// total on success. The sink is NOT opened, finished or cancelled here;
/// the caller owns its lifecycle (and its cleanup on error).
pub fn run_transfer<F>(
    session: &StreamSession,
    block_size: usize,
    mut fill: F,
    sink: &mut dyn Sink,
) -> Result<u64, Error>
where
    F: FnMut(u64, &mut [u8]) -> Result<(), Error> + Send,
{
    let total = session.total_size();

    std::thread::scope(|scope| -> Result<(), Error> {
        let reader = scope.spawn(move || -> Result<(), Error> {
            let mut offset = 0u64;
            while offset < total {
                let n = std::cmp::min(block_size as u64, total - offset) as usize;
                let mut buf = session.acquire_buffer()?;
                buf.resize(n, 0);

                if let Err(e) = fill(offset, &mut buf) {
                    session.set_read_error();
                    return Err(e);
                }

                session.publish(buf)?;
                offset += n as u64;
            }
            session.finish_reading();
            Ok(())
        });

        let mut write_result = Ok(());
        loop {
            match session.next_chunk() {
                Ok(Some(buf)) => {
                    if let Err(e) = sink.write(&buf) {
                        session.set_write_error();
                        write_result = Err(e);
                        break;
                    }
                    session.complete_chunk(buf);
                }
                Ok(None) => break,
                Err(e) => {
                    write_result = Err(e);
                    break;
                }
            }
        }

        let read_result = reader.join().expect("reader fiber panicked");

        // Reader failures carry the precise cause; writer failures
        // otherwise.
        read_result?;
        write_result
    })?;

    let written = session.data_written();
    if written != total && !session.is_cancelled() {
        return Err(Error::InvalidState(format!(
            "transfer ended early: {:#x} of {:#x} bytes",
            written, total
        )));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::sink::RecordingSink;

    #[test]
    fn test_ordered_delivery_and_totals() {
        let total = 0x2801u64; // intentionally unaligned
        let session = StreamSession::with_block_size(total, 0x1000);
        let mut sink = RecordingSink::new();
        sink.begin_file("t.bin", total, 0).unwrap();

        let written = run_transfer(
            &session,
            0x1000,
            |offset, buf| {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = ((offset + i as u64) % 251) as u8;
                }
                Ok(())
            },
            &mut sink,
        )
        .unwrap();
        sink.end_file().unwrap();

        assert_eq!(written, total);
        assert_eq!(session.data_written(), total);

        let expected: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        assert_eq!(sink.data(), &expected[..]);
        // Chunks arrived in order, none partial except the tail.
        assert_eq!(sink.write_sizes(), vec![0x1000, 0x1000, 0x801]);
    }

    #[test]
    fn test_reader_error_propagates() {
        let session = StreamSession::with_block_size(0x4000, 0x1000);
        let mut sink = RecordingSink::new();
        sink.begin_file("t.bin", 0x4000, 0).unwrap();

        let result = run_transfer(
            &session,
            0x1000,
            |offset, _buf| {
                if offset >= 0x2000 {
                    Err(Error::CorruptNca("simulated".into()))
                } else {
                    Ok(())
                }
            },
            &mut sink,
        );
        assert!(matches!(result, Err(Error::CorruptNca(_))));
        assert!(sink.data().len() <= 0x2000);
    }

    #[test]
    fn test_writer_error_propagates() {
        let session = StreamSession::with_block_size(0x4000, 0x1000);
        let mut sink = RecordingSink::new();
        sink.begin_file("t.bin", 0x4000, 0).unwrap();
        sink.fail_after(1);

        let result = run_transfer(&session, 0x1000, |_, _| Ok(()), &mut sink);
        assert!(matches!(result, Err(Error::SinkIoError(_))));
        assert_eq!(session.data_written(), 0x1000);
    }

    #[test]
    fn test_cancellation_stops_both_sides() {
        let session = StreamSession::with_block_size(0x8000, 0x1000);
        let mut sink = RecordingSink::new();
        sink.begin_file("t.bin", 0x8000, 0).unwrap();

        let result = run_transfer(
            &session,
            0x1000,
            |offset, _buf| {
                if offset >= 0x2000 {
                    session.cancel();
                }
                Ok(())
            },
            &mut sink,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(session.is_cancelled());
        // Nothing past the cancellation point reached the sink.
        assert!(sink.data().len() <= 0x3000);
    }

    #[test]
    fn test_zero_length_transfer() {
        let session = StreamSession::with_block_size(0, 0x1000);
        let mut sink = RecordingSink::new();
        sink.begin_file("t.bin", 0, 0).unwrap();
        let written = run_transfer(&session, 0x1000, |_, _| Ok(()), &mut sink).unwrap();
        assert_eq!(written, 0);
        assert!(sink.data().is_empty());
    }
}
