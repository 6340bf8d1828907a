//! CRC-32/ISO-HDLC (reflected, polynomial `0xEDB88320`), as used for the
//! image checksum, entry data checksums and `OriginalCrc32` metadata.

use std::io;

use crc32fast::Hasher;

/// Incremental CRC32 accumulator.
///
/// Feeding the same bytes in any chunking gives the same [`Crc32::finalize`].
#[derive(Debug, Clone)]
pub struct Crc32 {
    hasher: Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Checksum of everything folded in so far. Does not reset the state.
    pub fn finalize(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for Crc32 {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(checksum(&[]), 0x0000_0000);
        assert_eq!(Crc32::new().finalize(), 0);
    }

    #[test]
    fn known_vectors() {
        assert_eq!(checksum(&[0u8; 32]), 0x190A_55AD);
        assert_eq!(checksum(&[0xFFu8; 32]), 0xFF6C_AB0B);
        assert_eq!(checksum(&[0x01]), 0xA505_DF1B);
        assert_eq!(checksum(b"A"), 0xD3D9_9E8B);
        assert_eq!(checksum(b"Hello World"), 0x4A17_B156);
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn chunking_does_not_change_result() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let whole = checksum(&data);
        for chunk in [1, 3, 7, 64, 999] {
            let mut crc = Crc32::new();
            for part in data.chunks(chunk) {
                crc.update(part);
            }
            assert_eq!(crc.finalize(), whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn finalize_is_repeatable() {
        let mut crc = Crc32::new();
        crc.update(b"Hello");
        let first = crc.finalize();
        assert_eq!(crc.finalize(), first);
        crc.update(b" World");
        assert_eq!(crc.finalize(), 0x4A17_B156);
    }

    #[test]
    fn accumulator_matches_one_shot_checksum() {
        let data = b"DROFS keeps compressed files small on flash.";
        let mut crc = Crc32::default();
        crc.update(&data[..10]);
        crc.update(&data[10..]);
        assert_eq!(crc.finalize(), checksum(data));
    }

    #[test]
    fn io_copy_into_accumulator() {
        let mut crc = Crc32::new();
        io::copy(&mut &b"Hello World"[..], &mut crc).unwrap();
        assert_eq!(crc.finalize(), 0x4A17_B156);
    }
}
