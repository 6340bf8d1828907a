//! Pull-based zlib decompression over a compressed entry.
//!
//! The whole compressed payload is known up front. Output is staged through a
//! window of the inflate history size and handed out in whatever chunk sizes
//! the caller asks for, so memory use does not depend on the file size.

use std::fmt;

use miniz_oxide::inflate::{
    core::{decompress, inflate_flags, DecompressorOxide},
    TINFLStatus,
};

use crate::{Entry, Error, Result};

/// Size of the staging window. Equal to the deflate history size, which
/// inflate needs to resolve back-references.
pub const WINDOW_SIZE: usize = 32 * 1024;

const INFLATE_FLAGS: u32 = inflate_flags::TINFL_FLAG_PARSE_ZLIB_HEADER
    | inflate_flags::TINFL_FLAG_HAS_MORE_INPUT
    | inflate_flags::TINFL_FLAG_COMPUTE_ADLER32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// More output may follow.
    Streaming,
    /// Every byte has been handed out; no more output will be produced.
    Exhausted,
    /// Inflate reported an error. The stream is unusable.
    Failed,
}

/// Decompression context over one compressed byte range.
///
/// The window is the only allocation and is released on drop.
pub struct Decompressor<'a> {
    inflater: DecompressorOxide,
    window: Box<[u8]>,
    input: &'a [u8],
    read_pos: usize,
    unread: usize,
    write_pos: usize,
    pending_output: bool,
    inflate_done: bool,
    state: StreamState,
}

impl<'a> Decompressor<'a> {
    pub fn new(compressed: &'a [u8]) -> Self {
        Self {
            inflater: DecompressorOxide::new(),
            window: vec![0u8; WINDOW_SIZE].into_boxed_slice(),
            input: compressed,
            read_pos: 0,
            unread: 0,
            write_pos: 0,
            pending_output: false,
            inflate_done: false,
            state: StreamState::Streaming,
        }
    }

    /// Context over the stored data of `entry`. The caller is expected to
    /// have checked [`Entry::is_compressed`].
    pub fn for_entry(entry: &Entry<'a>) -> Self {
        Self::new(entry.data())
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Compressed bytes not yet consumed by inflate.
    pub fn remaining_input(&self) -> usize {
        self.input.len()
    }

    /// Fills as much of `out` as the stream allows.
    ///
    /// Returns the number of bytes written and the state after the call. A
    /// call that hands out the final bytes already reports
    /// [`StreamState::Exhausted`]; calling again after that, or after a
    /// failure, is [`Error::StreamExhausted`].
    pub fn decode_into(&mut self, out: &mut [u8]) -> Result<(usize, StreamState)> {
        if self.state != StreamState::Streaming {
            return Err(Error::StreamExhausted);
        }

        let mut written = 0;
        loop {
            if self.unread > 0 {
                let n = self.unread.min(out.len() - written);
                out[written..written + n]
                    .copy_from_slice(&self.window[self.read_pos..self.read_pos + n]);
                self.read_pos += n;
                self.unread -= n;
                written += n;
            }
            if written == out.len() || !self.can_inflate() {
                break;
            }
            self.inflate_step()?;
        }

        if self.unread == 0 && !self.can_inflate() {
            if !self.inflate_done {
                log::warn!("deflate stream ended before its final block");
            }
            log::debug!("decompression stream exhausted");
            self.state = StreamState::Exhausted;
        }
        Ok((written, self.state))
    }

    fn can_inflate(&self) -> bool {
        !self.inflate_done && (!self.input.is_empty() || self.pending_output)
    }

    /// Runs inflate once into the free tail of the window. Only called with
    /// no unread bytes staged.
    fn inflate_step(&mut self) -> Result<()> {
        let (status, consumed, produced) = decompress(
            &mut self.inflater,
            self.input,
            &mut self.window,
            self.write_pos,
            INFLATE_FLAGS,
        );
        self.input = &self.input[consumed..];
        self.read_pos = self.write_pos;
        self.unread = produced;
        self.write_pos = (self.write_pos + produced) & (WINDOW_SIZE - 1);

        match status {
            TINFLStatus::Done => self.inflate_done = true,
            TINFLStatus::HasMoreOutput => self.pending_output = true,
            TINFLStatus::NeedsMoreInput => self.pending_output = false,
            failed => {
                log::warn!("inflate failed with {failed:?}");
                self.state = StreamState::Failed;
                return Err(Error::Decompression(failed));
            }
        }
        if consumed == 0 && produced == 0 && !self.inflate_done {
            // no progress possible; treat the input as spent
            self.input = &[];
            self.pending_output = false;
        }
        Ok(())
    }
}

impl fmt::Debug for Decompressor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decompressor")
            .field("remaining_input", &self.input.len())
            .field("unread", &self.unread)
            .field("inflate_done", &self.inflate_done)
            .field("state", &self.state)
            .finish()
    }
}
