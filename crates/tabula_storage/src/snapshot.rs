//! Snapshot file format.
//!
//! A snapshot is the full committed contents of an engine:
//!
//! ```text
//! | magic (4) | version (u16) | table_count (u32) |
//! | table* | crc32 (u32) |
//!
//! table:
//! | id (u32) | name_len (u32) | name | id_counter (u64) | entry_count (u64) |
//! | (key_len (u32) | key | value_len (u32) | value)* |
//! ```
//!
//! All integers are little-endian. The trailing CRC covers every byte before it.

use crate::error::{StorageError, StorageResult};

/// Magic bytes at the start of every snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"TBLS";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Contents of one table inside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableImage {
    /// Table id.
    pub id: u32,
    /// Table name.
    pub name: String,
    /// Auto-increment counter.
    pub id_counter: u64,
    /// Key/value pairs in key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// A decoded snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Tables in id order.
    pub tables: Vec<TableImage>,
}

impl Snapshot {
    /// Total number of entries across all tables.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.tables.iter().map(|t| t.entries.len()).sum()
    }

    /// Encodes the snapshot.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.tables.len() as u32).to_le_bytes());

        for table in &self.tables {
            buf.extend_from_slice(&table.id.to_le_bytes());
            put_bytes(&mut buf, table.name.as_bytes());
            buf.extend_from_slice(&table.id_counter.to_le_bytes());
            buf.extend_from_slice(&(table.entries.len() as u64).to_le_bytes());
            for (key, value) in &table.entries {
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, value);
            }
        }

        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a snapshot, verifying magic, version and checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the bytes are not a valid snapshot.
    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        if data.len() < SNAPSHOT_MAGIC.len() + 2 + 4 + 4 {
            return Err(StorageError::corrupted("snapshot too short"));
        }

        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = compute_crc32(body);
        if stored != actual {
            return Err(StorageError::corrupted(format!(
                "checksum mismatch: expected {stored:08x}, got {actual:08x}"
            )));
        }

        let mut reader = Reader { data: body, pos: 0 };
        if reader.take(4)? != SNAPSHOT_MAGIC {
            return Err(StorageError::corrupted("bad snapshot magic"));
        }
        let version = reader.u16()?;
        if version != SNAPSHOT_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported snapshot version {version}"
            )));
        }

        let table_count = reader.u32()?;
        let mut tables = Vec::with_capacity(table_count.min(1024) as usize);
        for _ in 0..table_count {
            let id = reader.u32()?;
            let name = String::from_utf8(reader.bytes()?.to_vec())
                .map_err(|_| StorageError::corrupted("table name is not UTF-8"))?;
            let id_counter = reader.u64()?;
            let entry_count = reader.u64()?;
            let mut entries = Vec::new();
            for _ in 0..entry_count {
                let key = reader.bytes()?.to_vec();
                let value = reader.bytes()?.to_vec();
                entries.push((key, value));
            }
            tables.push(TableImage {
                id,
                name,
                id_counter,
                entries,
            });
        }

        if reader.pos != body.len() {
            return Err(StorageError::corrupted("trailing bytes after last table"));
        }

        Ok(Self { tables })
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| StorageError::corrupted("unexpected end of snapshot"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> StorageResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> StorageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> StorageResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes(&mut self) -> StorageResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot {
            tables: vec![
                TableImage {
                    id: 1,
                    name: "users".into(),
                    id_counter: 42,
                    entries: vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), vec![])],
                },
                TableImage {
                    id: 2,
                    name: "items".into(),
                    id_counter: 0,
                    entries: vec![],
                },
            ],
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn snapshot_decode_matches_encoded() {
        let snapshot = sample();
        let decoded = Snapshot::decode(&snapshot.encode()).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.entry_count(), 2);
    }

    #[test]
    fn snapshot_detects_bit_flip() {
        let mut bytes = sample().encode();
        bytes[12] ^= 0x40;
        assert!(matches!(
            Snapshot::decode(&bytes),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn snapshot_rejects_truncation() {
        let bytes = sample().encode();
        assert!(Snapshot::decode(&bytes[..bytes.len() - 7]).is_err());
        assert!(Snapshot::decode(&bytes[..3]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn decode_never_panics_on_garbage(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let _ = Snapshot::decode(&bytes);
        }
    }
}
