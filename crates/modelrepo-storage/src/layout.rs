//! Layer directory layout definitions
//!
//! Layer layout:
//! ```text
//! <root>/
//! +-- layer.hdr                 Header: magic, format version, layer UUID, CRC32C
//! +-- manifest.bin              Framed bincode: unit and filesystem tables
//! +-- units/
//!     +-- <local unit id>/
//!         +-- data.<generation> Append-only records
//!         +-- index             Framed bincode: record index -> IndexEntry
//! ```
//!
//! Record format:
//! ```text
//! +--------+---------+
//! | Length | Payload |
//! | 4B LE  | var     |
//! +--------+---------+
//! ```
//!
//! Framed file format (index, manifest):
//! ```text
//! +-------+---------+--------+---------+--------+
//! | Magic | Version | Length | Payload | CRC32C |
//! | 4B    | 4B      | 4B     | var     | 4B     |
//! +-------+---------+--------+---------+--------+
//! ```
//!
//! Index and manifest files are replaced with write-to-temp + rename, so a
//! reader or a crash observes either the old or the new file, never a mix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use modelrepo_common::checksum::{compute_crc32c, verify_crc32c};
use modelrepo_common::{Error, Result, SyncMode, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Magic number for layer headers
pub const LAYER_MAGIC: [u8; 8] = *b"MREPOLYR";

/// Magic number of unit index files
pub const INDEX_MAGIC: u32 = 0x5849_524D; // "MRIX"

/// Magic number of manifest files
pub const MANIFEST_MAGIC: u32 = 0x464D_524D; // "MRMF"

/// Version of the framed file envelope
const FRAME_VERSION: u32 = 1;

/// Framed file header size (magic + version + length)
const FRAME_HEADER_SIZE: usize = 12;

/// Size of the record length prefix
pub const RECORD_PREFIX_SIZE: u64 = 4;

pub const HEADER_FILE: &str = "layer.hdr";
pub const MANIFEST_FILE: &str = "manifest.bin";
pub const UNITS_DIR: &str = "units";
pub const INDEX_FILE: &str = "index";

/// Name of the data file of a given generation
#[must_use]
pub fn data_file_name(generation: u32) -> String {
    format!("data.{generation}")
}

/// Directory holding one unit's files
#[must_use]
pub fn unit_dir(root: &Path, unit: UnitId) -> PathBuf {
    root.join(UNITS_DIR).join(unit.get().to_string())
}

/// Header stored at the root of every layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerHeader {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version the layer was written with
    pub version: u32,
    /// Unique layer identifier
    pub layer_uuid: Uuid,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
    /// Flags
    pub flags: u32,
    /// Checksum of header (excluding this field)
    pub checksum: u32,
}

impl LayerHeader {
    /// Serialized size
    pub const SIZE: usize = 8 + 4 + 16 + 8 + 4 + 4;

    /// Offset of the checksum field
    const CHECKSUM_OFFSET: usize = Self::SIZE - 4;

    /// Create a header for a new layer
    #[must_use]
    pub fn new(version: u32) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut header = Self {
            magic: LAYER_MAGIC,
            version,
            layer_uuid: Uuid::new_v4(),
            created_at,
            flags: 0,
            checksum: 0,
        };
        header.update_checksum();
        header
    }

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.layer_uuid.as_bytes());
        buf.put_u64_le(self.created_at);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.checksum);
        buf.freeze()
    }

    /// Deserialize from bytes, checking magic and checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::storage("layer header too small"));
        }

        let mut buf = &data[..Self::SIZE];
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != LAYER_MAGIC {
            return Err(Error::storage("invalid layer header magic"));
        }

        let version = buf.get_u32_le();
        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let created_at = buf.get_u64_le();
        let flags = buf.get_u32_le();
        let checksum = buf.get_u32_le();

        let header = Self {
            magic,
            version,
            layer_uuid: Uuid::from_bytes(uuid_bytes),
            created_at,
            flags,
            checksum,
        };

        if header.compute_checksum() != checksum {
            return Err(Error::storage("layer header checksum mismatch"));
        }

        Ok(header)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        compute_crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }

    /// Recompute checksum after modifying fields
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Read the header of the layer rooted at `root`, if there is one
    pub fn read_from(root: &Path) -> Result<Option<Self>> {
        let path = root.join(HEADER_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        Self::from_bytes(&data).map(Some)
    }

    /// Write the header of the layer rooted at `root`
    pub fn write_to(&self, root: &Path) -> Result<()> {
        write_file_atomic(&root.join(HEADER_FILE), &self.to_bytes(), SyncMode::Always)
    }
}

/// Index entry flag: the record was removed (masks lower layers)
pub const FLAG_REMOVED: u8 = 0x01;

/// Index entry flag: never cache this record
pub const FLAG_NO_CACHE: u8 = 0x02;

/// Location of one committed record inside a unit's data file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Offset of the length prefix in the data file
    pub offset: u64,
    /// Payload length
    pub len: u32,
    /// CRC32C of the payload
    pub crc: u32,
    /// Commit sequence that produced this entry
    pub seq: u64,
    /// `FLAG_*` bits
    pub flags: u8,
}

impl IndexEntry {
    /// Entry for a stored payload
    #[must_use]
    pub const fn record(offset: u64, len: u32, crc: u32, seq: u64, flags: u8) -> Self {
        Self {
            offset,
            len,
            crc,
            seq,
            flags,
        }
    }

    /// Entry marking a removed record
    #[must_use]
    pub const fn tombstone(seq: u64) -> Self {
        Self {
            offset: 0,
            len: 0,
            crc: 0,
            seq,
            flags: FLAG_REMOVED,
        }
    }

    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.flags & FLAG_REMOVED != 0
    }

    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        self.flags & (FLAG_REMOVED | FLAG_NO_CACHE) == 0
    }

    /// Bytes this entry occupies in the data file
    #[must_use]
    pub const fn footprint(&self) -> u64 {
        if self.is_removed() {
            0
        } else {
            RECORD_PREFIX_SIZE + self.len as u64
        }
    }
}

/// Contents of a unit's index file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitIndexFile {
    /// Generation of the data file the entries point into
    pub generation: u32,
    /// Committed length of the data file
    pub data_len: u64,
    /// Record index -> location
    pub entries: BTreeMap<u32, IndexEntry>,
}

impl UnitIndexFile {
    /// Highest commit sequence referenced by this index
    #[must_use]
    pub fn max_seq(&self) -> u64 {
        self.entries.values().map(|e| e.seq).max().unwrap_or(0)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::Serialization(format!("failed to serialize index: {e}")))?;
        Ok(encode_frame(INDEX_MAGIC, &payload))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let payload = decode_frame(INDEX_MAGIC, data)?;
        bincode::deserialize(payload)
            .map_err(|e| Error::Serialization(format!("failed to deserialize index: {e}")))
    }
}

/// Length of a record payload as stored in its `u32` prefix
pub fn record_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::storage(format!("record of {len} bytes exceeds the u32 length limit")))
}

/// Encode a record: `[len: u32 LE][payload]`
pub fn encode_record(payload: &[u8], out: &mut BytesMut) -> Result<u32> {
    let len = record_len(payload.len())?;
    out.put_u32_le(len);
    out.put_slice(payload);
    Ok(len)
}

/// Wrap a payload in the framed file envelope
#[must_use]
pub fn encode_frame(magic: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len() + 4);
    buf.put_u32_le(magic);
    buf.put_u32_le(FRAME_VERSION);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    let crc = compute_crc32c(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

/// Validate a framed file envelope and return its payload
pub fn decode_frame(magic: u32, data: &[u8]) -> Result<&[u8]> {
    if data.len() < FRAME_HEADER_SIZE + 4 {
        return Err(Error::storage("framed file too small"));
    }

    let mut header = &data[..FRAME_HEADER_SIZE];
    let found_magic = header.get_u32_le();
    if found_magic != magic {
        return Err(Error::storage(format!(
            "invalid frame magic {found_magic:08x}, expected {magic:08x}"
        )));
    }
    let version = header.get_u32_le();
    if version != FRAME_VERSION {
        return Err(Error::storage(format!("unsupported frame version {version}")));
    }
    let len = header.get_u32_le() as usize;

    let end = FRAME_HEADER_SIZE + len;
    if data.len() < end + 4 {
        return Err(Error::storage("framed file truncated"));
    }

    let stored_crc = (&data[end..end + 4]).get_u32_le();
    if !verify_crc32c(&data[..end], stored_crc) {
        return Err(Error::storage("framed file CRC mismatch"));
    }

    Ok(&data[FRAME_HEADER_SIZE..end])
}

/// Replace `path` with `data` via a temporary file and rename
pub fn write_file_atomic(path: &Path, data: &[u8], sync: SyncMode) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::storage(format!("invalid file path {}", path.display())))?;
    let temp_path = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(data)?;
        if sync != SyncMode::Never {
            file.sync_all()?;
        }
    }

    // Atomic rename
    std::fs::rename(&temp_path, path)?;

    if sync == SyncMode::Always {
        if let Some(parent) = path.parent() {
            sync_dir(parent);
        }
    }
    Ok(())
}

/// Best-effort fsync of a directory entry table
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Read exactly `buf.len()` bytes at `offset` without moving a shared cursor
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            done += n;
        }
        Ok(())
    }
}
