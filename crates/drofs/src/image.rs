use byteorder::{ByteOrder, LittleEndian};

use crate::{
    crc32, reader::EntryReader, walk::Walk, Entry, Error, Result, CHECKSUM_OFFSET, MAGIC,
    TREE_BASE,
};

/// A DROFS image borrowed from externally owned storage.
///
/// Construction only checks that the header fits. Call [`Image::verify`], or
/// use [`Image::mount`], before trusting anything decoded from it.
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    bytes: &'a [u8],
}

impl<'a> Image<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < TREE_BASE {
            return Err(Error::TruncatedHeader(bytes.len()));
        }
        Ok(Self { bytes })
    }

    /// [`Image::new`] followed by [`Image::verify`].
    pub fn mount(bytes: &'a [u8]) -> Result<Self> {
        let image = Self::new(bytes)?;
        image.verify()?;
        log::debug!("mounted image of {} bytes", bytes.len());
        Ok(image)
    }

    /// Checks the magic and the whole-image CRC32 over everything past the
    /// header.
    pub fn verify(&self) -> Result<()> {
        if &self.bytes[..MAGIC.len()] != MAGIC {
            log::warn!("bad magic {:02x?}", &self.bytes[..MAGIC.len()]);
            return Err(Error::InvalidMagic);
        }
        let expected = self.stored_checksum();
        let actual = crc32::checksum(self.tree());
        if actual != expected {
            log::warn!(
                "image checksum {:#010x} != stored {:#010x} over {} bytes",
                actual,
                expected,
                self.tree().len()
            );
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    pub fn stored_checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[CHECKSUM_OFFSET..TREE_BASE])
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The entry tree, starting at the tree base.
    pub fn tree(&self) -> &'a [u8] {
        &self.bytes[TREE_BASE..]
    }

    /// Decodes the entry at a tree-relative offset.
    pub fn entry_at(&self, offset: u32) -> Result<Entry<'a>> {
        Entry::decode(self.tree(), offset)
    }

    pub fn root(&self) -> Result<Entry<'a>> {
        self.entry_at(0)
    }

    /// Decodes the `index`-th child of `entry`.
    pub fn child(&self, entry: &Entry<'a>, index: usize) -> Result<Entry<'a>> {
        let offset = entry.child_offset(index).ok_or(Error::ChildIndex {
            index,
            count: entry.children_len(),
        })?;
        self.entry_at(offset)
    }

    /// Decodes the children of `entry` in stored order.
    pub fn children(&self, entry: &Entry<'a>) -> impl Iterator<Item = Result<Entry<'a>>> + 'a {
        let image = *self;
        entry.children().map(move |offset| image.entry_at(offset))
    }

    /// First child of `parent` whose name equals `name`.
    ///
    /// A child that fails to decode aborts the lookup; it is never skipped.
    pub fn lookup(&self, parent: &Entry<'a>, name: &[u8]) -> Result<Option<Entry<'a>>> {
        for child in self.children(parent) {
            let child = child?;
            if child.name() == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Resolves a slash-separated path from the root. Empty segments are
    /// ignored, so `""` and `"/"` both name the root.
    pub fn resolve(&self, path: &str) -> Result<Entry<'a>> {
        let mut current = self.root()?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = match self.lookup(&current, segment.as_bytes())? {
                Some(child) => child,
                None => {
                    log::debug!("{path}: no child named {segment:?}");
                    return Err(Error::PathNotFound(path.to_string()));
                }
            };
        }
        Ok(current)
    }

    /// Opens the file at `path` for reading its original contents.
    pub fn open(&self, path: &str) -> Result<EntryReader<'a>> {
        let entry = self.resolve(path)?;
        if !entry.is_file() {
            return Err(Error::NotAFile(path.to_string()));
        }
        Ok(EntryReader::new(&entry))
    }

    /// Recursively walks the tree below `path`, depth first.
    pub fn walk(&self, path: &str) -> Result<Walk<'a>> {
        let start = self.resolve(path)?;
        Ok(Walk::new(*self, start, path))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::builder::{DirEntryBuilder, FileEntryBuilder, ImageBuilder};
    use crate::EntryType;

    const FILE1: &str = "Hello, this is file1.";
    const FILE2: &str = "This is file2 in a subdirectory.";

    fn sample() -> Vec<u8> {
        ImageBuilder::new(
            DirEntryBuilder::new("sample")
                .timestamp(1_759_254_090)
                .file(FileEntryBuilder::new("file1.txt", FILE1).timestamp(1_759_254_090))
                .dir(
                    DirEntryBuilder::new("subdir")
                        .file(FileEntryBuilder::new("file2.txt", FILE2).timestamp(1_759_254_091)),
                ),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn valid_image_verifies() {
        let bytes = sample();
        let image = Image::new(&bytes).unwrap();
        image.verify().unwrap();
        assert!(image.is_valid());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample();
        bytes[..5].copy_from_slice(b"BADHD");
        assert!(matches!(Image::mount(&bytes), Err(Error::InvalidMagic)));
    }

    #[test]
    fn bad_stored_checksum_is_rejected() {
        let mut bytes = sample();
        bytes[5..9].copy_from_slice(&0x0BAD_BEEFu32.to_le_bytes());
        assert!(matches!(
            Image::mount(&bytes),
            Err(Error::ChecksumMismatch { expected: 0x0BAD_BEEF, .. })
        ));
    }

    #[test]
    fn any_flipped_byte_fails_verification() {
        let bytes = sample();
        for i in 0..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0x40;
            assert!(!Image::new(&corrupt).unwrap().is_valid(), "byte {i}");
        }
    }

    #[test]
    fn short_buffer_is_truncated_header() {
        assert!(matches!(Image::new(b"DROFS\0\0"), Err(Error::TruncatedHeader(7))));
    }

    #[test]
    fn root_resolves_to_directory() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        for path in ["/", "", "//"] {
            let root = image.resolve(path).unwrap();
            assert_eq!(root.kind(), EntryType::Directory);
            assert_eq!(root.offset(), 0);
            assert_eq!(root.name(), b"sample");
        }
    }

    #[test]
    fn file1_contents() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        let entry = image.resolve("/file1.txt").unwrap();
        assert_eq!(entry.kind(), EntryType::File);
        assert_eq!(entry.data().len(), 21);
        assert_eq!(entry.data(), FILE1.as_bytes());
    }

    #[test]
    fn file2_contents_and_checksum() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        let entry = image.resolve("/subdir/file2.txt").unwrap();
        assert_eq!(entry.kind(), EntryType::File);
        assert_eq!(entry.data().len(), 32);
        assert_eq!(entry.data(), FILE2.as_bytes());
        entry.verify().unwrap();
        assert_eq!(entry.original_size(), Some(32));
        assert!(entry.timestamp().unwrap() >= 1_758_000_000);
    }

    #[test]
    fn redundant_slashes_are_tolerated() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        let a = image.resolve("subdir//file2.txt/").unwrap();
        let b = image.resolve("/subdir/file2.txt").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_paths_are_not_found() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        for path in ["/nope", "/subdir/nope", "/nope/file2.txt", "/file1.txt/x", "/FILE1.TXT"] {
            assert!(
                matches!(image.resolve(path), Err(Error::PathNotFound(ref p)) if p == path),
                "{path}"
            );
        }
    }

    #[test]
    fn unmatched_middle_segment_fails_fast() {
        // "/nope/file1.txt" must not fall back to the root and find file1.txt
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        assert!(matches!(
            image.resolve("/nope/file1.txt"),
            Err(Error::PathNotFound(_))
        ));
    }

    #[test]
    fn directories_are_valid_targets() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        let subdir = image.resolve("/subdir").unwrap();
        assert!(subdir.is_dir());
        assert_eq!(subdir.children_len(), 1);
        let first = image.child(&subdir, 0).unwrap();
        assert_eq!(first.name_str(), Some("file2.txt"));
        first.verify().unwrap();
        assert!(matches!(
            image.child(&subdir, 1),
            Err(Error::ChildIndex { index: 1, count: 1 })
        ));
    }

    #[test]
    fn resolution_is_repeatable() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        let first = image.resolve("/subdir/file2.txt").unwrap();
        let second = image.resolve("/subdir/file2.txt").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.data().as_ptr(), second.data().as_ptr());
        assert_eq!(image.entry_at(first.offset()).unwrap(), first);
    }

    #[test]
    fn invalid_child_type_aborts_resolution() {
        let mut bytes = sample();
        let image = Image::new(&bytes).unwrap();
        let subdir = image.resolve("/subdir").unwrap();
        let at = TREE_BASE + image.root().unwrap().child_offset(0).unwrap() as usize;
        assert_ne!(subdir.offset() as usize + TREE_BASE, at);
        bytes[at] = 7;
        let image = Image::new(&bytes).unwrap();
        assert!(matches!(
            image.resolve("/subdir"),
            Err(Error::InvalidEntryType { value: 7, .. })
        ));
    }

    #[test]
    fn invalid_root_type_is_corrupt() {
        let mut bytes = sample();
        bytes[TREE_BASE] = 0;
        let image = Image::new(&bytes).unwrap();
        let err = image.resolve("/").unwrap_err();
        assert!(matches!(err, Error::InvalidEntryType { offset: 0, value: 0 }));
        assert!(err.is_corrupt());
    }

    #[test]
    fn child_offset_past_end_is_malformed() {
        let mut bytes = sample();
        let image = Image::new(&bytes).unwrap();
        let root = image.root().unwrap();
        // the first child is written right after the root's two-slot table
        let table_end = TREE_BASE + root.child_offset(0).unwrap() as usize;
        let slot = table_end - 8;
        bytes[slot..slot + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let image = Image::new(&bytes).unwrap();
        assert!(matches!(
            image.resolve("/file1.txt"),
            Err(Error::MalformedEntry { offset: u32::MAX, field: "offset" })
        ));
    }

    #[test]
    fn open_reads_file_and_rejects_directories() {
        let bytes = sample();
        let image = Image::mount(&bytes).unwrap();
        let mut content = String::new();
        image
            .open("/subdir/file2.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, FILE2);
        assert!(matches!(image.open("/subdir"), Err(Error::NotAFile(_))));
    }
}
