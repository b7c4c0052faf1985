//! On-disk needle format.
//!
//! Layout (all integers little-endian), carried over from the teacher's
//! `store/needle.rs` with the CRC32C checksum swapped for SHA256 per the spec's data
//! model and the cookie field kept as the teacher's wire format defines it:
//!
//! `[magic:4][photo_id:8][cookie:16][flags:1][size:8][payload:size][checksum:32][trailer:4]`

use crate::error::{StoreError, StoreResult};
use crate::types::{BlockOffset, Cookie, PhotoId, BLOCK_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read, Write};
use std::mem::size_of;

const HEADER_MAGIC: &[u8; 4] = b"NEED";
const FOOTER_MAGIC: &[u8; 4] = b"LES!";

const COOKIE_SIZE: usize = size_of::<Cookie>();
const CHECKSUM_SIZE: usize = 32;

pub const NEEDLE_HEADER_SIZE: usize = 4 + 8 + COOKIE_SIZE + 1 + 8;
pub const NEEDLE_FOOTER_SIZE: usize = CHECKSUM_SIZE + 4;

const FLAG_TOMBSTONE: u8 = 1;

/// Flags and size recorded both in the on-disk header and the in-memory index entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeedleMeta {
    pub flags: u8,
    pub size: u64,
}

impl NeedleMeta {
    pub fn live(size: u64) -> NeedleMeta {
        NeedleMeta { flags: 0, size }
    }

    pub fn tombstone() -> NeedleMeta {
        NeedleMeta {
            flags: FLAG_TOMBSTONE,
            size: 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }
}

/// Where a needle lives within its volume file, in the in-memory index.
#[derive(Clone, Copy, Debug)]
pub struct NeedleIndexEntry {
    pub meta: NeedleMeta,
    pub block_offset: BlockOffset,
}

impl NeedleIndexEntry {
    pub fn byte_offset(&self) -> u64 {
        (self.block_offset as u64) * (BLOCK_SIZE as u64)
    }
}

pub struct NeedleHeader {
    pub photo_id: PhotoId,
    pub cookie: Cookie,
    pub meta: NeedleMeta,
}

impl NeedleHeader {
    pub fn parse(buf: &[u8]) -> StoreResult<NeedleHeader> {
        if buf.len() < NEEDLE_HEADER_SIZE {
            return Err(StoreError::Corrupt("needle header truncated".into()));
        }
        if &buf[0..4] != HEADER_MAGIC {
            return Err(StoreError::Corrupt("needle header magic mismatch".into()));
        }

        let mut cursor = Cursor::new(&buf[4..]);
        let photo_id = cursor.read_u64::<LittleEndian>()?;

        let mut cookie = [0u8; COOKIE_SIZE];
        cursor.read_exact(&mut cookie)?;

        let flags = cursor.read_u8()?;
        let size = cursor.read_u64::<LittleEndian>()?;

        Ok(NeedleHeader {
            photo_id,
            cookie,
            meta: NeedleMeta { flags, size },
        })
    }

    pub fn serialize(photo_id: PhotoId, cookie: &Cookie, meta: &NeedleMeta) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NEEDLE_HEADER_SIZE);
        buf.extend_from_slice(HEADER_MAGIC);
        buf.write_u64::<LittleEndian>(photo_id).unwrap();
        buf.extend_from_slice(cookie);
        buf.write_u8(meta.flags).unwrap();
        buf.write_u64::<LittleEndian>(meta.size).unwrap();
        buf
    }
}

pub struct NeedleFooter;

impl NeedleFooter {
    pub fn write(writer: &mut impl Write, checksum: &[u8; CHECKSUM_SIZE]) -> std::io::Result<()> {
        writer.write_all(checksum)?;
        writer.write_all(FOOTER_MAGIC)?;
        Ok(())
    }
}

/// An in-memory, fully-read needle: header plus payload, with its trailing checksum
/// already validated against the magic (but not yet checked for correctness -
/// see [`Needle::check`]).
pub struct Needle {
    pub header: NeedleHeader,
    buf: Vec<u8>,
    checksum: [u8; CHECKSUM_SIZE],
}

impl Needle {
    /// Reads one needle from the current position of `reader`, given the size
    /// recorded for it in the index.
    pub fn read_oneshot(reader: &mut impl Read, meta: &NeedleMeta) -> StoreResult<Needle> {
        let total = NEEDLE_HEADER_SIZE + (meta.size as usize) + NEEDLE_FOOTER_SIZE;
        let mut raw = vec![0u8; total];
        reader.read_exact(&mut raw)?;

        let header = NeedleHeader::parse(&raw[..NEEDLE_HEADER_SIZE])?;
        if header.meta.size != meta.size {
            return Err(StoreError::Corrupt(
                "needle size does not match index entry".into(),
            ));
        }

        let payload_end = NEEDLE_HEADER_SIZE + (meta.size as usize);
        let footer = &raw[payload_end..];
        let checksum: [u8; CHECKSUM_SIZE] = footer[..CHECKSUM_SIZE].try_into().unwrap();
        let trailer = &footer[CHECKSUM_SIZE..];

        if trailer != FOOTER_MAGIC {
            return Err(StoreError::Corrupt("needle footer magic mismatch".into()));
        }

        Ok(Needle {
            header,
            buf: raw,
            checksum,
        })
    }

    pub fn data(&self) -> &[u8] {
        let start = NEEDLE_HEADER_SIZE;
        let end = start + (self.header.meta.size as usize);
        &self.buf[start..end]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let start = NEEDLE_HEADER_SIZE;
        let end = start + (self.header.meta.size as usize);
        let mut buf = self.buf;
        buf.truncate(end);
        buf.drain(..start);
        buf
    }

    pub fn checksum(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.checksum
    }

    /// Verifies that the payload matches its recorded SHA256 checksum.
    pub fn check(&self) -> StoreResult<()> {
        let sum = sha256(self.data());
        if &sum != self.checksum() {
            return Err(StoreError::Corrupt(
                "needle payload does not match checksum".into(),
            ));
        }
        Ok(())
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Given the current end-of-file offset, how many padding bytes are needed to reach
/// the next block boundary.
pub fn block_size_remainder(end_offset: u64) -> u64 {
    let rem = (end_offset as usize) % BLOCK_SIZE;
    if rem == 0 {
        0
    } else {
        (BLOCK_SIZE - rem) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let cookie = [7u8; COOKIE_SIZE];
        let meta = NeedleMeta::live(42);
        let buf = NeedleHeader::serialize(99, &cookie, &meta);
        let parsed = NeedleHeader::parse(&buf).unwrap();
        assert_eq!(parsed.photo_id, 99);
        assert_eq!(parsed.cookie, cookie);
        assert_eq!(parsed.meta, meta);
    }

    #[test]
    fn tombstone_flag_roundtrips() {
        let meta = NeedleMeta::tombstone();
        assert!(meta.is_tombstone());
        assert_eq!(meta.size, 0);
    }

    #[test]
    fn full_needle_round_trips_and_checks_out() {
        let cookie = [1u8; COOKIE_SIZE];
        let payload = b"hello haystack";
        let meta = NeedleMeta::live(payload.len() as u64);
        let sum = sha256(payload);

        let mut raw = NeedleHeader::serialize(5, &cookie, &meta);
        raw.extend_from_slice(payload);
        NeedleFooter::write(&mut raw, &sum).unwrap();

        let mut cursor = Cursor::new(raw);
        let needle = Needle::read_oneshot(&mut cursor, &meta).unwrap();
        assert_eq!(needle.data(), payload);
        needle.check().unwrap();
    }

    #[test]
    fn detects_checksum_mismatch() {
        let cookie = [1u8; COOKIE_SIZE];
        let payload = b"hello haystack";
        let meta = NeedleMeta::live(payload.len() as u64);
        let wrong_sum = sha256(b"not the payload");

        let mut raw = NeedleHeader::serialize(5, &cookie, &meta);
        raw.extend_from_slice(payload);
        NeedleFooter::write(&mut raw, &wrong_sum).unwrap();

        let mut cursor = Cursor::new(raw);
        let needle = Needle::read_oneshot(&mut cursor, &meta).unwrap();
        assert!(needle.check().is_err());
    }

    #[test]
    fn block_remainder_is_zero_when_aligned() {
        assert_eq!(block_size_remainder(128), 0);
        assert_eq!(block_size_remainder(0), 0);
    }

    proptest::proptest! {
        #[test]
        fn header_round_trips_for_any_field_values(
            photo_id: PhotoId,
            cookie_bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), COOKIE_SIZE..=COOKIE_SIZE),
            size: u64,
            tombstone: bool,
        ) {
            let cookie: Cookie = cookie_bytes.try_into().unwrap();
            let meta = if tombstone { NeedleMeta::tombstone() } else { NeedleMeta::live(size) };

            let buf = NeedleHeader::serialize(photo_id, &cookie, &meta);
            let parsed = NeedleHeader::parse(&buf).unwrap();

            prop_assert_eq!(parsed.photo_id, photo_id);
            prop_assert_eq!(parsed.cookie, cookie);
            prop_assert_eq!(parsed.meta, meta);
        }
    }
}
