//! Startup snapshot reading, and the canonical blob served on full resync.
//!
//! The reader understands the subset of the RDB format needed to repopulate
//! string keys: the `REDIS` magic and version, auxiliary fields, database
//! selectors and resize hints, second- and millisecond-precision expiry
//! prefixes, and type-0 (string) entries. Anything else is reported as
//! unsupported. Keys flow into the store through [`Store::restore`], which
//! drops entries whose recorded expiry has already passed.

use std::path::Path;

use base64::Engine;
use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::Store;

/// The empty snapshot emitted to a follower during full resync, as a
/// base64 literal.
pub const EMPTY_SNAPSHOT_B64: &str = "UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

/// Decodes [`EMPTY_SNAPSHOT_B64`].
pub fn empty_snapshot() -> Bytes {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(EMPTY_SNAPSHOT_B64)
        .expect("the canonical snapshot literal decodes");
    Bytes::from(decoded)
}

/// Reads the snapshot file at `path` into `store`.
///
/// A missing file is a fresh start, not an error. Returns the number of
/// keys restored (skipped-expired entries not included).
pub fn read_file(path: &Path, store: &mut Store) -> StoreResult<usize> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot file; starting empty");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };
    let restored = read_bytes(&bytes, store)?;
    info!(path = %path.display(), restored, "snapshot loaded");
    Ok(restored)
}

/// Reads snapshot `bytes` into `store`, returning the number of keys kept.
pub fn read_bytes(bytes: &[u8], store: &mut Store) -> StoreResult<usize> {
    let mut reader = Reader { bytes, pos: 0 };

    if reader.take(5)? != b"REDIS" {
        return Err(StoreError::Snapshot("missing magic".into()));
    }
    let version = reader.take(4)?;
    debug!(version = %String::from_utf8_lossy(version), "snapshot header");

    let mut restored = 0;
    loop {
        match reader.peek()? {
            0xFF => {
                // End marker; an 8-byte checksum may follow. Not verified.
                break;
            }
            0xFA => {
                reader.advance(1);
                let _key = reader.string()?;
                let _value = reader.string()?;
            }
            0xFE => {
                reader.advance(1);
                let _db = reader.length()?;
            }
            0xFB => {
                reader.advance(1);
                let _hash_size = reader.length()?;
                let _expire_size = reader.length()?;
            }
            0xFC => {
                reader.advance(1);
                let expire_ms = reader.u64_le()?;
                restored += usize::from(reader.entry(store, Some(expire_ms))?);
            }
            0xFD => {
                reader.advance(1);
                let expire_ms = u64::from(reader.u32_le()?) * 1000;
                restored += usize::from(reader.entry(store, Some(expire_ms))?);
            }
            0x00 => {
                restored += usize::from(reader.entry(store, None)?);
            }
            other => {
                return Err(StoreError::Snapshot(format!(
                    "unexpected opcode 0x{other:02x}"
                )));
            }
        }
    }
    Ok(restored)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn peek(&self) -> StoreResult<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| StoreError::Snapshot("truncated file".into()))
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn take(&mut self, n: usize) -> StoreResult<&[u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(StoreError::Snapshot("truncated file".into()));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> StoreResult<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().expect("4 bytes");
        Ok(u32::from_le_bytes(raw))
    }

    fn u64_le(&mut self) -> StoreResult<u64> {
        let raw: [u8; 8] = self.take(8)?.try_into().expect("8 bytes");
        Ok(u64::from_le_bytes(raw))
    }

    /// A plain length header. Rejects the special string-encoding forms.
    fn length(&mut self) -> StoreResult<usize> {
        match self.length_or_special()? {
            LengthForm::Length(n) => Ok(n),
            LengthForm::Special(kind) => Err(StoreError::Snapshot(format!(
                "length expected, found special encoding {kind}"
            ))),
        }
    }

    fn length_or_special(&mut self) -> StoreResult<LengthForm> {
        let first = self.u8()?;
        match first >> 6 {
            0b00 => Ok(LengthForm::Length(usize::from(first & 0x3F))),
            0b01 => {
                let low = self.u8()?;
                Ok(LengthForm::Length(
                    (usize::from(first & 0x3F) << 8) | usize::from(low),
                ))
            }
            0b10 => {
                let raw: [u8; 4] = self.take(4)?.try_into().expect("4 bytes");
                Ok(LengthForm::Length(u32::from_be_bytes(raw) as usize))
            }
            _ => Ok(LengthForm::Special(first & 0x3F)),
        }
    }

    /// A string payload: length-prefixed raw bytes, or an integer encoded
    /// in 8/16/32 bits rendered back to its decimal text.
    fn string(&mut self) -> StoreResult<Bytes> {
        match self.length_or_special()? {
            LengthForm::Length(n) => Ok(Bytes::copy_from_slice(self.take(n)?)),
            LengthForm::Special(0) => {
                let n = self.u8()? as i8;
                Ok(Bytes::from(n.to_string()))
            }
            LengthForm::Special(1) => {
                let raw: [u8; 2] = self.take(2)?.try_into().expect("2 bytes");
                Ok(Bytes::from(i16::from_le_bytes(raw).to_string()))
            }
            LengthForm::Special(2) => {
                let raw: [u8; 4] = self.take(4)?.try_into().expect("4 bytes");
                Ok(Bytes::from(i32::from_le_bytes(raw).to_string()))
            }
            LengthForm::Special(kind) => Err(StoreError::Snapshot(format!(
                "unknown string encoding {kind}"
            ))),
        }
    }

    /// One key/value entry. Only the string value type is supported.
    fn entry(&mut self, store: &mut Store, expire_at_unix_ms: Option<u64>) -> StoreResult<bool> {
        let value_type = self.u8()?;
        if value_type != 0x00 {
            return Err(StoreError::Snapshot(format!(
                "unsupported value type 0x{value_type:02x}"
            )));
        }
        let key = self.string()?;
        let value = self.string()?;
        let key = String::from_utf8_lossy(&key).into_owned();
        Ok(store.restore(key, value, expire_at_unix_ms))
    }
}

enum LengthForm {
    Length(usize),
    Special(u8),
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn header() -> Vec<u8> {
        let mut bytes = b"REDIS0011".to_vec();
        bytes.extend_from_slice(&[0xFE, 0x00]); // select db 0
        bytes.extend_from_slice(&[0xFB, 0x02, 0x01]); // resize hints
        bytes
    }

    fn push_string(bytes: &mut Vec<u8>, s: &[u8]) {
        bytes.push(s.len() as u8);
        bytes.extend_from_slice(s);
    }

    #[test]
    fn empty_snapshot_decodes_with_magic() {
        let blob = empty_snapshot();
        assert!(blob.starts_with(b"REDIS0011"));
        assert_eq!(blob.len(), 88);
    }

    #[test]
    fn empty_snapshot_reads_back_as_zero_keys() {
        let mut store = Store::new();
        let restored = read_bytes(&empty_snapshot(), &mut store).unwrap();
        assert_eq!(restored, 0);
    }

    #[test]
    fn reads_plain_string_entries() {
        let mut bytes = header();
        bytes.push(0x00);
        push_string(&mut bytes, b"foo");
        push_string(&mut bytes, b"bar");
        bytes.push(0xFF);

        let mut store = Store::new();
        assert_eq!(read_bytes(&bytes, &mut store).unwrap(), 1);
        assert_eq!(store.get("foo"), Some(Bytes::from_static(b"bar")));
    }

    #[test]
    fn honors_ms_expiry_and_skips_passed_entries() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;

        let mut bytes = header();
        // Long-expired key.
        bytes.push(0xFC);
        bytes.extend_from_slice(&500u64.to_le_bytes());
        bytes.push(0x00);
        push_string(&mut bytes, b"stale");
        push_string(&mut bytes, b"x");
        // Key with a comfortable future expiry.
        bytes.push(0xFC);
        bytes.extend_from_slice(&(now_ms + 60_000).to_le_bytes());
        bytes.push(0x00);
        push_string(&mut bytes, b"fresh");
        push_string(&mut bytes, b"y");
        bytes.push(0xFF);

        let mut store = Store::new();
        assert_eq!(read_bytes(&bytes, &mut store).unwrap(), 1);
        assert_eq!(store.get("stale"), None);
        assert_eq!(store.get("fresh"), Some(Bytes::from_static(b"y")));
    }

    #[test]
    fn honors_second_expiry_prefix() {
        let now_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;

        let mut bytes = header();
        bytes.push(0xFD);
        bytes.extend_from_slice(&(now_s + 60).to_le_bytes());
        bytes.push(0x00);
        push_string(&mut bytes, b"k");
        push_string(&mut bytes, b"v");
        bytes.push(0xFF);

        let mut store = Store::new();
        assert_eq!(read_bytes(&bytes, &mut store).unwrap(), 1);
        assert_eq!(store.get("k"), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn decodes_integer_encoded_strings() {
        let mut bytes = header();
        bytes.push(0x00);
        push_string(&mut bytes, b"int8");
        bytes.extend_from_slice(&[0xC0, 0x2A]); // special 0: i8 42
        bytes.push(0x00);
        push_string(&mut bytes, b"int16");
        bytes.push(0xC1);
        bytes.extend_from_slice(&1000i16.to_le_bytes());
        bytes.push(0x00);
        push_string(&mut bytes, b"int32");
        bytes.push(0xC2);
        bytes.extend_from_slice(&(-70000i32).to_le_bytes());
        bytes.push(0xFF);

        let mut store = Store::new();
        assert_eq!(read_bytes(&bytes, &mut store).unwrap(), 3);
        assert_eq!(store.get("int8"), Some(Bytes::from_static(b"42")));
        assert_eq!(store.get("int16"), Some(Bytes::from_static(b"1000")));
        assert_eq!(store.get("int32"), Some(Bytes::from_static(b"-70000")));
    }

    #[test]
    fn decodes_fourteen_bit_lengths() {
        let mut bytes = header();
        bytes.push(0x00);
        push_string(&mut bytes, b"big");
        let payload = vec![b'a'; 300];
        bytes.push(0x40 | 0x01); // 14-bit: 0b01, high bits 1
        bytes.push(0x2C); // 0x12C == 300
        bytes.extend_from_slice(&payload);
        bytes.push(0xFF);

        let mut store = Store::new();
        assert_eq!(read_bytes(&bytes, &mut store).unwrap(), 1);
        assert_eq!(store.get("big"), Some(Bytes::from(payload)));
    }

    #[test]
    fn rejects_unknown_constructs() {
        let mut bytes = header();
        bytes.push(0x09); // a value type outside the subset
        assert!(matches!(
            read_bytes(&bytes, &mut Store::new()),
            Err(StoreError::Snapshot(_))
        ));

        assert!(matches!(
            read_bytes(b"NOPE", &mut Store::new()),
            Err(StoreError::Snapshot(_))
        ));
    }

    #[test]
    fn missing_file_is_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::new();
        let restored = read_file(&dir.path().join("absent.rdb"), &mut store).unwrap();
        assert_eq!(restored, 0);
    }

    #[test]
    fn reads_a_snapshot_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        let mut bytes = header();
        bytes.push(0x00);
        push_string(&mut bytes, b"disk");
        push_string(&mut bytes, b"value");
        bytes.push(0xFF);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let mut store = Store::new();
        assert_eq!(read_file(&path, &mut store).unwrap(), 1);
        assert_eq!(store.get("disk"), Some(Bytes::from_static(b"value")));
    }
}
