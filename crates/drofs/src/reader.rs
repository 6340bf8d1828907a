use std::{cmp, io};

use crate::{crc32::Crc32, Decompressor, Entry, Error, Result, StreamState};

/// A handle on the original contents of a file entry.
///
/// Uncompressed entries are read straight out of the image; compressed ones
/// go through a [`Decompressor`]. `EntryReader` implements [`std::io::Read`].
#[derive(Debug)]
pub struct EntryReader<'a> {
    source: Source<'a>,
}

#[derive(Debug)]
enum Source<'a> {
    Raw { data: &'a [u8], pos: usize },
    Inflate(Decompressor<'a>),
}

impl<'a> EntryReader<'a> {
    pub fn new(entry: &Entry<'a>) -> Self {
        let source = if entry.is_compressed() {
            Source::Inflate(Decompressor::for_entry(entry))
        } else {
            Source::Raw {
                data: entry.data(),
                pos: 0,
            }
        };
        Self { source }
    }

    /// Reads the next chunk of original bytes into `buf`. Returns 0 once the
    /// contents are exhausted. After an inflate error every later call fails
    /// with [`Error::StreamExhausted`].
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.source {
            Source::Raw { data, pos } => {
                let n = cmp::min(buf.len(), data.len() - *pos);
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Source::Inflate(ctx) => match ctx.state() {
                StreamState::Exhausted => Ok(0),
                // a failed stream keeps failing instead of reading as EOF
                StreamState::Failed => Err(Error::StreamExhausted),
                StreamState::Streaming => Ok(ctx.decode_into(buf)?.0),
            },
        }
    }
}

impl io::Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Streams the original contents of `entry` and checks them against its
/// `OriginalSize` and `OriginalCrc32` metadata.
///
/// An uncompressed entry without `OriginalCrc32` is checked against its data
/// checksum instead, since its original bytes are its stored bytes.
pub fn verify_original(entry: &Entry<'_>) -> Result<()> {
    let mut reader = EntryReader::new(entry);
    let mut crc = Crc32::new();
    let mut len = 0u64;
    let mut buf = [0u8; 1024];
    loop {
        let n = reader.read_chunk(&mut buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
        len += n as u64;
    }

    if let Some(expected) = entry.original_size() {
        if u64::from(expected) != len {
            return Err(Error::OriginalSizeMismatch {
                expected,
                actual: len,
            });
        }
    }

    let expected = match entry.original_crc32() {
        Some(expected) => Some(expected),
        None if !entry.is_compressed() => Some(entry.data_checksum()),
        None => None,
    };
    if let Some(expected) = expected {
        let actual = crc.finalize();
        if actual != expected {
            log::warn!(
                "{:?}: original checksum {:#010x} != stored {:#010x}",
                String::from_utf8_lossy(entry.name()),
                actual,
                expected
            );
            return Err(Error::ChecksumMismatch { expected, actual });
        }
    }
    Ok(())
}
