//! WAL v2 record codec: binary layout constants, encoding, and decoding.
//!
//! Every record is self-delimiting and checksummed:
//!
//! ```text
//! ┌──────────────── header (22 bytes, packed) ────────────────┐
//! │ magic:u32 | version:u8 | type:u8 | txid:u64               │
//! │ key_len:u32 | value_len:u32                               │
//! ├──────────── payload (key_len + value_len bytes) ──────────┤
//! │ key bytes | value bytes                                   │
//! ├──────────────────────── trailer ──────────────────────────┤
//! │ crc32:u32 over header ‖ key ‖ value                       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The CRC is the IEEE (zlib/gzip) CRC-32.

use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{self, Read};
use thiserror::Error;

/// Magic number identifying WAL v2 records (ASCII "WAL2").
pub const WAL_MAGIC: u32 = 0x5741_4C32;

/// Current on-disk format version. Records with any other version byte are
/// refused (the v1 format is superseded).
pub const WAL_VERSION: u8 = 0x02;

/// Size of the packed record header in bytes:
/// 4 (`magic`) + 1 (`version`) + 1 (`type`) + 8 (`txid`) + 4 (`key_len`) + 4 (`value_len`).
pub const HEADER_BYTES: usize = 22;

/// Maximum allowed key length: 1 MiB.
pub const MAX_KEY_LEN: u32 = 1 << 20;

/// Maximum allowed value length: 16 MiB.
pub const MAX_VALUE_LEN: u32 = 1 << 24;

/// Transactional record types.
///
/// `Begin` has zero durability meaning on its own; a transaction exists iff
/// its `Commit` record survives in the valid prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Begin = 0x10,
    Put = 0x11,
    Delete = 0x12,
    Commit = 0x13,
}

impl RecordType {
    fn from_u8(b: u8) -> Option<RecordType> {
        match b {
            0x10 => Some(RecordType::Begin),
            0x11 => Some(RecordType::Put),
            0x12 => Some(RecordType::Delete),
            0x13 => Some(RecordType::Commit),
            _ => None,
        }
    }
}

/// A fully decoded and checksum-verified WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rtype: RecordType,
    pub txid: u64,
    /// Empty for `Begin` and `Commit`.
    pub key: Vec<u8>,
    /// Empty for everything except `Put`.
    pub value: Vec<u8>,
}

/// Why decoding stopped before a complete, valid record.
///
/// Any of these ends the valid prefix during replay. They are surfaced as
/// diagnostics, never as errors: an unclean shutdown is expected.
#[derive(Debug, Error)]
pub enum Corruption {
    #[error("truncated header: {got} of {HEADER_BYTES} bytes")]
    TruncatedHeader { got: usize },
    #[error("bad magic: {found:#010x}")]
    BadMagic { found: u32 },
    #[error("unsupported format version: {found:#04x}")]
    UnsupportedVersion { found: u8 },
    #[error("unknown record type: {found:#04x}")]
    UnknownRecordType { found: u8 },
    #[error("key length {len} exceeds limit {MAX_KEY_LEN}")]
    KeyTooLarge { len: u32 },
    #[error("value length {len} exceeds limit {MAX_VALUE_LEN}")]
    ValueTooLarge { len: u32 },
    #[error("record type {rtype:?} must not carry a payload")]
    StrayPayload { rtype: RecordType },
    #[error("truncated payload: {got} of {want} bytes")]
    TruncatedPayload { got: usize, want: usize },
    #[error("truncated checksum trailer")]
    TruncatedChecksum,
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("read failed mid-record: {0}")]
    Io(#[source] io::Error),
}

/// Outcome of [`decode_next`].
#[derive(Debug)]
pub enum Decoded {
    /// A complete record passed every format and checksum check.
    Record(Record),
    /// Clean EOF at a record boundary.
    EndOfLog,
    /// The valid prefix ends here.
    Corrupt(Corruption),
}

fn encode_record(rtype: RecordType, txid: u64, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_BYTES + key.len() + value.len() + 4);
    buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
    buf.push(WAL_VERSION);
    buf.push(rtype as u8);
    buf.extend_from_slice(&txid.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Encodes a `BEGIN(txid)` record.
pub fn encode_begin(txid: u64) -> Vec<u8> {
    encode_record(RecordType::Begin, txid, &[], &[])
}

/// Encodes a `PUT(txid, key, value)` record.
pub fn encode_put(txid: u64, key: &[u8], value: &[u8]) -> Vec<u8> {
    encode_record(RecordType::Put, txid, key, value)
}

/// Encodes a `DELETE(txid, key)` record.
pub fn encode_delete(txid: u64, key: &[u8]) -> Vec<u8> {
    encode_record(RecordType::Delete, txid, key, &[])
}

/// Encodes a `COMMIT(txid)` record.
pub fn encode_commit(txid: u64) -> Vec<u8> {
    encode_record(RecordType::Commit, txid, &[], &[])
}

/// Header fields in record order: magic, version, type, txid, key_len,
/// value_len.
struct Header {
    magic: u32,
    version: u8,
    type_byte: u8,
    txid: u64,
    key_len: u32,
    value_len: u32,
}

fn parse_header(header: &[u8; HEADER_BYTES]) -> io::Result<Header> {
    let mut fields = &header[..];
    Ok(Header {
        magic: fields.read_u32::<LittleEndian>()?,
        version: fields.read_u8()?,
        type_byte: fields.read_u8()?,
        txid: fields.read_u64::<LittleEndian>()?,
        key_len: fields.read_u32::<LittleEndian>()?,
        value_len: fields.read_u32::<LittleEndian>()?,
    })
}

/// Reads as many bytes as the reader will give, retrying on interrupt.
///
/// Returns the number of bytes actually read; short counts mean EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Decodes the next record from `r`.
///
/// Validation order: header completeness, magic, version, type, length
/// bounds, payload-shape rules, payload completeness, checksum. The first
/// failed check wins; nothing after a corrupt record is trusted.
pub fn decode_next<R: Read>(r: &mut R) -> Decoded {
    let mut header = [0u8; HEADER_BYTES];
    let got = match read_full(r, &mut header) {
        Ok(n) => n,
        Err(e) => return Decoded::Corrupt(Corruption::Io(e)),
    };
    if got == 0 {
        return Decoded::EndOfLog;
    }
    if got < HEADER_BYTES {
        return Decoded::Corrupt(Corruption::TruncatedHeader { got });
    }

    let hdr = match parse_header(&header) {
        Ok(h) => h,
        Err(e) => return Decoded::Corrupt(Corruption::Io(e)),
    };

    if hdr.magic != WAL_MAGIC {
        return Decoded::Corrupt(Corruption::BadMagic { found: hdr.magic });
    }
    if hdr.version != WAL_VERSION {
        return Decoded::Corrupt(Corruption::UnsupportedVersion {
            found: hdr.version,
        });
    }
    let rtype = match RecordType::from_u8(hdr.type_byte) {
        Some(t) => t,
        None => {
            return Decoded::Corrupt(Corruption::UnknownRecordType {
                found: hdr.type_byte,
            })
        }
    };
    if hdr.key_len > MAX_KEY_LEN {
        return Decoded::Corrupt(Corruption::KeyTooLarge { len: hdr.key_len });
    }
    if hdr.value_len > MAX_VALUE_LEN {
        return Decoded::Corrupt(Corruption::ValueTooLarge { len: hdr.value_len });
    }
    let key_allowed = matches!(rtype, RecordType::Put | RecordType::Delete);
    let value_allowed = rtype == RecordType::Put;
    if (!key_allowed && hdr.key_len != 0) || (!value_allowed && hdr.value_len != 0) {
        return Decoded::Corrupt(Corruption::StrayPayload { rtype });
    }

    let payload_len = hdr.key_len as usize + hdr.value_len as usize;
    let mut payload = vec![0u8; payload_len];
    match read_full(r, &mut payload) {
        Ok(n) if n == payload_len => {}
        Ok(n) => {
            return Decoded::Corrupt(Corruption::TruncatedPayload {
                got: n,
                want: payload_len,
            })
        }
        Err(e) => return Decoded::Corrupt(Corruption::Io(e)),
    }

    let mut crc_buf = [0u8; 4];
    match read_full(r, &mut crc_buf) {
        Ok(4) => {}
        Ok(_) => return Decoded::Corrupt(Corruption::TruncatedChecksum),
        Err(e) => return Decoded::Corrupt(Corruption::Io(e)),
    }
    let stored = u32::from_le_bytes(crc_buf);

    let mut hasher = Crc32::new();
    hasher.update(&header);
    hasher.update(&payload);
    let computed = hasher.finalize();
    if stored != computed {
        return Decoded::Corrupt(Corruption::ChecksumMismatch { stored, computed });
    }

    let value = payload.split_off(hdr.key_len as usize);
    Decoded::Record(Record {
        rtype,
        txid: hdr.txid,
        key: payload,
        value,
    })
}
