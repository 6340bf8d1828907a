//! Image construction, for packing tools and tests.
//!
//! Entries are written depth-first: a node first, then its children, with
//! the node's child offset table patched once the children have landed.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::{crc32, EntryFlags, EntryType, Error, MetadataTag, Result, MAGIC};

pub struct FileEntryBuilder {
    pub(crate) name: String,
    pub(crate) data: Vec<u8>,
    pub(crate) level: Option<u8>,
    pub(crate) timestamp: Option<u32>,
    pub(crate) extra_metadata: Vec<(u8, Vec<u8>)>,
}

impl FileEntryBuilder {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            level: None,
            timestamp: None,
            extra_metadata: Vec::new(),
        }
    }
    /// zlib-compress the data at `level` (1-10). The compressed form is only
    /// kept when it is smaller than the original.
    pub fn compress(mut self, level: u8) -> Self {
        self.level = (level > 0).then_some(level);
        self
    }
    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
    pub fn metadata(mut self, tag: MetadataTag, data: Vec<u8>) -> Self {
        self.extra_metadata.push((tag.into(), data));
        self
    }
}

pub struct DirEntryBuilder {
    pub(crate) name: String,
    pub(crate) children: Vec<NodeBuilder>,
    pub(crate) timestamp: Option<u32>,
    pub(crate) extra_metadata: Vec<(u8, Vec<u8>)>,
}

impl DirEntryBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            timestamp: None,
            extra_metadata: Vec::new(),
        }
    }
    pub fn file(mut self, file: FileEntryBuilder) -> Self {
        self.children.push(NodeBuilder::File(file));
        self
    }
    pub fn dir(mut self, dir: DirEntryBuilder) -> Self {
        self.children.push(NodeBuilder::Dir(dir));
        self
    }
    pub fn push(&mut self, node: NodeBuilder) {
        self.children.push(node);
    }
    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
    pub fn metadata(mut self, tag: MetadataTag, data: Vec<u8>) -> Self {
        self.extra_metadata.push((tag.into(), data));
        self
    }
}

pub enum NodeBuilder {
    File(FileEntryBuilder),
    Dir(DirEntryBuilder),
}

impl From<FileEntryBuilder> for NodeBuilder {
    fn from(file: FileEntryBuilder) -> Self {
        Self::File(file)
    }
}

impl From<DirEntryBuilder> for NodeBuilder {
    fn from(dir: DirEntryBuilder) -> Self {
        Self::Dir(dir)
    }
}

/// Serializes a tree rooted at a directory into a complete image.
pub struct ImageBuilder {
    root: DirEntryBuilder,
}

impl ImageBuilder {
    pub fn new(root: DirEntryBuilder) -> Self {
        Self { root }
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let mut tree = Vec::new();
        write_dir(&mut tree, &self.root)?;

        let mut image = Vec::with_capacity(crate::TREE_BASE + tree.len());
        image.extend_from_slice(MAGIC);
        image.write_u32::<LittleEndian>(crc32::checksum(&tree))?;
        image.extend_from_slice(&tree);
        Ok(image)
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> Result<usize> {
        let image = self.build()?;
        w.write_all(&image)?;
        Ok(image.len())
    }
}

fn write_node(tree: &mut Vec<u8>, node: &NodeBuilder) -> Result<u32> {
    match node {
        NodeBuilder::File(file) => write_file(tree, file),
        NodeBuilder::Dir(dir) => write_dir(tree, dir),
    }
}

fn write_file(tree: &mut Vec<u8>, file: &FileEntryBuilder) -> Result<u32> {
    let original_crc32 = crc32::checksum(&file.data);
    let original_size = u32::try_from(file.data.len())
        .map_err(|_| Error::Build(format!("{} is larger than 4 GiB", file.name)))?;

    let compressed;
    let mut stored = file.data.as_slice();
    let mut flags = EntryFlags::empty();
    let mut metadata: Vec<(u8, Vec<u8>)> = Vec::new();
    if let Some(level) = file.level {
        compressed = miniz_oxide::deflate::compress_to_vec_zlib(&file.data, level);
        if compressed.len() < file.data.len() {
            log::debug!(
                "{}: compressed {} -> {} bytes",
                file.name,
                file.data.len(),
                compressed.len()
            );
            flags |= EntryFlags::COMPRESSED;
            stored = &compressed;
            metadata.push((
                MetadataTag::OriginalCrc32.into(),
                original_crc32.to_le_bytes().to_vec(),
            ));
        }
    }
    metadata.push((
        MetadataTag::OriginalSize.into(),
        original_size.to_le_bytes().to_vec(),
    ));
    if let Some(timestamp) = file.timestamp {
        metadata.push((MetadataTag::Timestamp.into(), timestamp.to_le_bytes().to_vec()));
    }
    metadata.extend(file.extra_metadata.iter().cloned());

    let offset = write_header(tree, EntryType::File, &file.name, stored, flags, &metadata)?;
    tree.write_u32::<LittleEndian>(0)?;
    Ok(offset)
}

fn write_dir(tree: &mut Vec<u8>, dir: &DirEntryBuilder) -> Result<u32> {
    let mut metadata: Vec<(u8, Vec<u8>)> = Vec::new();
    if let Some(timestamp) = dir.timestamp {
        metadata.push((MetadataTag::Timestamp.into(), timestamp.to_le_bytes().to_vec()));
    }
    metadata.extend(dir.extra_metadata.iter().cloned());

    let offset = write_header(
        tree,
        EntryType::Directory,
        &dir.name,
        &[],
        EntryFlags::empty(),
        &metadata,
    )?;

    let count = u32::try_from(dir.children.len())
        .map_err(|_| Error::Build(format!("{} has too many children", dir.name)))?;
    tree.write_u32::<LittleEndian>(count)?;
    let table = tree.len();
    tree.resize(table + dir.children.len() * 4, 0);

    for (i, child) in dir.children.iter().enumerate() {
        let child_offset = write_node(tree, child)?;
        let slot = table + i * 4;
        LittleEndian::write_u32(&mut tree[slot..slot + 4], child_offset);
    }
    Ok(offset)
}

/// Everything up to, but not including, the children count.
fn write_header(
    tree: &mut Vec<u8>,
    kind: EntryType,
    name: &str,
    data: &[u8],
    flags: EntryFlags,
    metadata: &[(u8, Vec<u8>)],
) -> Result<u32> {
    let offset = u32::try_from(tree.len())
        .map_err(|_| Error::Build("tree is larger than 4 GiB".to_string()))?;

    let name_length = u8::try_from(name.len() + 1)
        .map_err(|_| Error::Build(format!("name {name:?} is longer than 254 bytes")))?;
    let data_length = u32::try_from(data.len())
        .map_err(|_| Error::Build(format!("data of {name:?} is larger than 4 GiB")))?;
    let metadata_count = u8::try_from(metadata.len())
        .map_err(|_| Error::Build(format!("{name:?} has more than 255 metadata items")))?;

    tree.write_u8(kind as u8)?;
    tree.write_u8(name_length)?;
    tree.extend_from_slice(name.as_bytes());
    tree.write_u8(0)?;
    tree.write_u32::<LittleEndian>(data_length)?;
    tree.write_u32::<LittleEndian>(crc32::checksum(data))?;
    tree.extend_from_slice(data);
    tree.write_u8(flags.bits())?;
    tree.write_u8(metadata_count)?;
    for (tag, value) in metadata {
        let len = u16::try_from(value.len())
            .map_err(|_| Error::Build(format!("metadata {tag} of {name:?} is too long")))?;
        tree.write_u8(*tag)?;
        tree.write_u16::<LittleEndian>(len)?;
        tree.extend_from_slice(value);
    }
    Ok(offset)
}
