//! Reader for DROFS images: compact, read-only filesystem images meant to
//! live in flash and be navigated in place.
//!
//! An image is a single byte buffer. Every [`Entry`] handed out by this crate
//! borrows from that buffer, so walking the tree never copies names or file
//! contents. Compressed files are recovered through the bounded-memory
//! [`Decompressor`], or through [`EntryReader`] when a [`std::io::Read`] is
//! more convenient.
//!
//! ```no_run
//! use std::io::Read;
//!
//! let bytes = std::fs::read("flash.drofs").unwrap();
//! let image = drofs::Image::mount(&bytes).unwrap();
//!
//! let mut content = Vec::new();
//! image.open("/etc/config.json").unwrap().read_to_end(&mut content).unwrap();
//! ```

#[cfg(any(test, feature = "builder"))]
pub mod builder;
pub mod crc32;
pub mod decompress;
pub mod entry;
mod error;
pub mod image;
mod read;
pub mod reader;
pub mod walk;

pub use crc32::Crc32;
pub use decompress::{Decompressor, StreamState, WINDOW_SIZE};
pub use entry::{ChildOffsets, Entry, EntryFlags, EntryType, Metadata, MetadataIter, MetadataTag};
pub use error::*;
pub use image::Image;
pub use reader::{verify_original, EntryReader};
pub use walk::{Walk, WalkEntry};

/// Literal signature at the start of every image.
pub const MAGIC: &[u8; 5] = b"DROFS";

/// Offset of the little-endian CRC32 covering everything from [`TREE_BASE`] on.
pub const CHECKSUM_OFFSET: usize = MAGIC.len();

/// Start of the entry tree. Entry and child offsets are relative to this.
pub const TREE_BASE: usize = CHECKSUM_OFFSET + 4;
