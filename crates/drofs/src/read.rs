use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, Result};

/// Bounds-checked forward cursor over the entry tree.
///
/// Errors carry the offset of the entry being decoded, not the cursor
/// position, so callers can point at the broken node.
pub(crate) struct ReadCursor<'a> {
    data: &'a [u8],
    pos: usize,
    entry: u32,
}

impl<'a> ReadCursor<'a> {
    pub fn at(data: &'a [u8], entry: u32) -> Result<Self> {
        let pos = entry as usize;
        if pos >= data.len() {
            return Err(Error::MalformedEntry {
                offset: entry,
                field: "offset",
            });
        }
        Ok(Self { data, pos, entry })
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::MalformedEntry {
                offset: self.entry,
                field,
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Bytes consumed since `start`, which must be an earlier [`Self::pos`].
    pub fn since(&self, start: usize) -> &'a [u8] {
        &self.data[start..self.pos]
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    pub fn read_u16_le(&mut self, field: &'static str) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2, field)?))
    }

    pub fn read_u32_le(&mut self, field: &'static str) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4, field)?))
    }
}
