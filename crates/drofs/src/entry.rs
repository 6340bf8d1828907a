use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::{crc32, read::ReadCursor, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntryType {
    File = 1,
    Directory = 2,
}

impl TryFrom<u8> for EntryType {
    type Error = u8;

    fn try_from(value: u8) -> core::result::Result<Self, u8> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            x => Err(x),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u8 {
        const COMPRESSED = 1 << 0;
    }
}

/// Tag of a [`Metadata`] item. Unknown tags are kept, not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataTag {
    OriginalSize,
    Timestamp,
    OriginalCrc32,
    Unknown(u8),
}

impl From<u8> for MetadataTag {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::OriginalSize,
            2 => Self::Timestamp,
            3 => Self::OriginalCrc32,
            x => Self::Unknown(x),
        }
    }
}

impl From<MetadataTag> for u8 {
    fn from(tag: MetadataTag) -> u8 {
        match tag {
            MetadataTag::OriginalSize => 1,
            MetadataTag::Timestamp => 2,
            MetadataTag::OriginalCrc32 => 3,
            MetadataTag::Unknown(x) => x,
        }
    }
}

/// One typed side-record of an entry, borrowed from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata<'a> {
    tag: MetadataTag,
    data: &'a [u8],
}

impl<'a> Metadata<'a> {
    pub fn tag(&self) -> MetadataTag {
        self.tag
    }

    pub fn len(&self) -> u16 {
        self.data.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// The payload as a little-endian `u32`, if it is exactly four bytes.
    pub fn as_u32(&self) -> Option<u32> {
        (self.data.len() == 4).then(|| LittleEndian::read_u32(self.data))
    }
}

/// Iterator over an entry's metadata block in stored order.
///
/// The block was bounds-checked when the entry was decoded.
#[derive(Debug, Clone)]
pub struct MetadataIter<'a> {
    bytes: &'a [u8],
    remaining: u8,
}

impl<'a> Iterator for MetadataIter<'a> {
    type Item = Metadata<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let (&tag, rest) = self.bytes.split_first()?;
        let len = LittleEndian::read_u16(rest.get(..2)?) as usize;
        let data = rest.get(2..2 + len)?;
        self.bytes = &rest[2 + len..];
        self.remaining -= 1;
        Some(Metadata {
            tag: tag.into(),
            data,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for MetadataIter<'_> {}

/// Child offsets of an entry, relative to the tree base.
#[derive(Debug, Clone)]
pub struct ChildOffsets<'a> {
    chunks: core::slice::ChunksExact<'a, u8>,
}

impl Iterator for ChildOffsets<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        self.chunks.next().map(LittleEndian::read_u32)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for ChildOffsets<'_> {}

/// A decoded file or directory node. Every slice points into the image.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    kind: EntryType,
    name: &'a [u8],
    data: &'a [u8],
    data_checksum: u32,
    flags: EntryFlags,
    metadata_count: u8,
    metadata: &'a [u8],
    children: &'a [u8],
    offset: u32,
}

impl<'a> Entry<'a> {
    /// Decodes the entry at `offset` within `tree`, checking every field
    /// against the end of the buffer before it is read.
    pub(crate) fn decode(tree: &'a [u8], offset: u32) -> Result<Self> {
        let mut cursor = ReadCursor::at(tree, offset)?;

        let value = cursor.read_u8("type")?;
        let kind =
            EntryType::try_from(value).map_err(|value| Error::InvalidEntryType { offset, value })?;

        let name_length = cursor.read_u8("name_length")?;
        let name = cursor.take(name_length as usize, "name")?;

        let data_length = cursor.read_u32_le("data_length")?;
        let data_checksum = cursor.read_u32_le("data_checksum")?;
        let data = cursor.take(data_length as usize, "data")?;

        let flags = EntryFlags::from_bits_retain(cursor.read_u8("flags")?);

        let metadata_count = cursor.read_u8("metadata_count")?;
        let metadata_start = cursor.pos();
        for _ in 0..metadata_count {
            cursor.read_u8("metadata_type")?;
            let len = cursor.read_u16_le("metadata_length")?;
            cursor.take(len as usize, "metadata_data")?;
        }
        let metadata = cursor.since(metadata_start);

        let children_count = cursor.read_u32_le("children_count")?;
        let children_len = (children_count as usize)
            .checked_mul(4)
            .ok_or(Error::MalformedEntry {
                offset,
                field: "children",
            })?;
        let children = cursor.take(children_len, "children")?;

        Ok(Self {
            kind,
            name,
            data,
            data_checksum,
            flags,
            metadata_count,
            metadata,
            children,
            offset,
        })
    }

    pub fn kind(&self) -> EntryType {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryType::File
    }

    /// The name without its NUL padding. If the slot holds no NUL the whole
    /// slot is the name.
    pub fn name(&self) -> &'a [u8] {
        match self.name.iter().position(|b| *b == 0) {
            Some(end) => &self.name[..end],
            None => self.name,
        }
    }

    pub fn name_str(&self) -> Option<&'a str> {
        core::str::from_utf8(self.name()).ok()
    }

    /// The name slot exactly as declared, padding included.
    pub fn raw_name(&self) -> &'a [u8] {
        self.name
    }

    /// Stored bytes, still compressed if [`Self::is_compressed`].
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn data_checksum(&self) -> u32 {
        self.data_checksum
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(EntryFlags::COMPRESSED)
    }

    /// Offset of this entry relative to the tree base.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn metadata(&self) -> MetadataIter<'a> {
        MetadataIter {
            bytes: self.metadata,
            remaining: self.metadata_count,
        }
    }

    /// First metadata item carrying `tag`, scanning in stored order.
    pub fn find_metadata(&self, tag: MetadataTag) -> Option<Metadata<'a>> {
        let tag = u8::from(tag);
        self.metadata().find(|m| u8::from(m.tag) == tag)
    }

    pub fn original_size(&self) -> Option<u32> {
        self.find_metadata(MetadataTag::OriginalSize)?.as_u32()
    }

    /// Unix time in seconds.
    pub fn timestamp(&self) -> Option<u32> {
        self.find_metadata(MetadataTag::Timestamp)?.as_u32()
    }

    pub fn original_crc32(&self) -> Option<u32> {
        self.find_metadata(MetadataTag::OriginalCrc32)?.as_u32()
    }

    pub fn children(&self) -> ChildOffsets<'a> {
        ChildOffsets {
            chunks: self.children.chunks_exact(4),
        }
    }

    pub fn children_len(&self) -> usize {
        self.children.len() / 4
    }

    pub fn child_offset(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(4)?;
        self.children
            .get(start..start.checked_add(4)?)
            .map(LittleEndian::read_u32)
    }

    /// Recomputes the CRC32 of the stored data and compares it with the
    /// checksum recorded in the entry.
    pub fn verify(&self) -> Result<()> {
        let actual = crc32::checksum(self.data);
        if actual != self.data_checksum {
            log::warn!(
                "entry {:?} at {}: data checksum {:#010x} != stored {:#010x}",
                String::from_utf8_lossy(self.name()),
                self.offset,
                actual,
                self.data_checksum
            );
            return Err(Error::ChecksumMismatch {
                expected: self.data_checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn is_intact(&self) -> bool {
        self.verify().is_ok()
    }
}

impl fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("kind", &self.kind)
            .field("name", &String::from_utf8_lossy(self.name()))
            .field("data_len", &self.data.len())
            .field("data_checksum", &format_args!("{:#010x}", self.data_checksum))
            .field("flags", &self.flags)
            .field("metadata", &self.metadata().collect::<Vec<_>>())
            .field("children", &self.children().collect::<Vec<_>>())
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A single file entry with one metadata item, laid out by hand.
    fn file_entry() -> Vec<u8> {
        let mut raw = vec![1u8, 4];
        raw.extend_from_slice(b"a.b\0");
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(&crc32::checksum(b"xyz").to_le_bytes());
        raw.extend_from_slice(b"xyz");
        raw.push(0);
        raw.push(1);
        raw.push(1);
        raw.extend_from_slice(&4u16.to_le_bytes());
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&100u32.to_le_bytes());
        raw.extend_from_slice(&200u32.to_le_bytes());
        raw
    }

    #[test]
    fn decodes_every_field() {
        let raw = file_entry();
        let entry = Entry::decode(&raw, 0).unwrap();
        assert_eq!(entry.kind(), EntryType::File);
        assert_eq!(entry.name(), b"a.b");
        assert_eq!(entry.raw_name(), b"a.b\0");
        assert_eq!(entry.data(), b"xyz");
        assert!(!entry.is_compressed());
        assert_eq!(entry.original_size(), Some(3));
        assert_eq!(entry.timestamp(), None);
        assert_eq!(entry.children().collect::<Vec<_>>(), vec![100, 200]);
        assert_eq!(entry.child_offset(1), Some(200));
        assert_eq!(entry.child_offset(2), None);
        entry.verify().unwrap();
    }

    #[test]
    fn decoding_twice_is_identical() {
        let raw = file_entry();
        assert_eq!(Entry::decode(&raw, 0).unwrap(), Entry::decode(&raw, 0).unwrap());
    }

    #[test]
    fn every_truncation_is_caught() {
        let raw = file_entry();
        for len in 1..raw.len() {
            let err = Entry::decode(&raw[..len], 0).unwrap_err();
            assert!(
                matches!(err, Error::MalformedEntry { offset: 0, .. }),
                "len {len}: {err:?}"
            );
        }
    }

    #[test]
    fn invalid_type_is_rejected() {
        let mut raw = file_entry();
        for value in [0u8, 3, 0xFF] {
            raw[0] = value;
            assert!(matches!(
                Entry::decode(&raw, 0),
                Err(Error::InvalidEntryType { offset: 0, value: v }) if v == value
            ));
        }
    }

    #[test]
    fn oversized_data_length_is_malformed() {
        let mut raw = file_entry();
        raw[6..10].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Entry::decode(&raw, 0),
            Err(Error::MalformedEntry { field: "data", .. })
        ));
    }

    #[test]
    fn name_without_nul_uses_whole_slot() {
        let mut raw = file_entry();
        raw[5] = b'c';
        let entry = Entry::decode(&raw, 0).unwrap();
        assert_eq!(entry.name(), b"a.bc");
        assert_eq!(entry.name_str(), Some("a.bc"));
    }

    #[test]
    fn corrupted_data_fails_verify() {
        let mut raw = file_entry();
        raw[14] ^= 0x01;
        let entry = Entry::decode(&raw, 0).unwrap();
        assert!(matches!(entry.verify(), Err(Error::ChecksumMismatch { .. })));
        assert!(!entry.is_intact());
    }

    #[test]
    fn first_matching_metadata_wins() {
        let mut raw = vec![2u8, 1, 0];
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.push(0);
        raw.push(3);
        for (tag, value) in [(2u8, 10u32), (9, 7), (2, 20)] {
            raw.push(tag);
            raw.extend_from_slice(&4u16.to_le_bytes());
            raw.extend_from_slice(&value.to_le_bytes());
        }
        raw.extend_from_slice(&0u32.to_le_bytes());

        let entry = Entry::decode(&raw, 0).unwrap();
        assert!(entry.is_dir());
        assert_eq!(entry.metadata().len(), 3);
        assert_eq!(entry.timestamp(), Some(10));
        let unknown = entry.find_metadata(MetadataTag::Unknown(9)).unwrap();
        assert_eq!(unknown.tag(), MetadataTag::Unknown(9));
        assert_eq!(unknown.as_u32(), Some(7));
        assert!(entry.find_metadata(MetadataTag::OriginalCrc32).is_none());
    }

    #[test]
    fn metadata_length_past_end_is_malformed() {
        let mut raw = file_entry();
        // metadata_length of the OriginalSize item
        raw[20..22].copy_from_slice(&0xFFFFu16.to_le_bytes());
        assert!(matches!(
            Entry::decode(&raw, 0),
            Err(Error::MalformedEntry { field: "metadata_data", .. })
        ));
    }

    #[test]
    fn children_count_past_end_is_malformed() {
        let mut raw = file_entry();
        let count_at = raw.len() - 12;
        raw[count_at..count_at + 4].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            Entry::decode(&raw, 0),
            Err(Error::MalformedEntry { field: "children", .. })
        ));
    }
}
