//! Typed binary codec for persisted objects
//!
//! All integers are little-endian. Strings and arrays are prefixed with a
//! `u32` element count. Unit and filesystem ids embedded in an object are
//! written through an optional [`IdTranslator`], so the bytes stored in a
//! layer always carry that layer's local numbering.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use modelrepo_common::{Error, FsId, Result, UnitId};
use std::sync::Arc;

/// Translation between client-global and layer-local id numbering
pub trait IdTranslator: Send + Sync {
    /// Client unit id to the layer's unit id
    fn unit_to_layer(&self, client: UnitId) -> Option<UnitId>;
    /// Layer unit id to the client's unit id
    fn unit_to_client(&self, layer: UnitId) -> Option<UnitId>;
    /// Client filesystem id to the layer's filesystem id
    fn fs_to_layer(&self, client: FsId) -> Option<FsId>;
    /// Layer filesystem id to the client's filesystem id
    fn fs_to_client(&self, layer: FsId) -> Option<FsId>;
}

/// Output stream an object serializes itself into
#[derive(Default)]
pub struct RepositoryDataOutput {
    buf: BytesMut,
    translator: Option<Arc<dyn IdTranslator>>,
}

impl RepositoryDataOutput {
    /// Create an output stream that writes ids unchanged
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an output stream that translates ids into a layer's numbering
    #[must_use]
    pub fn with_translator(translator: Arc<dyn IdTranslator>) -> Self {
        Self {
            buf: BytesMut::new(),
            translator: Some(translator),
        }
    }

    /// Number of bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and take the encoded bytes
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| Error::codec(format!("length {len} does not fit in u32")))?;
        self.buf.put_u32_le(len);
        Ok(())
    }

    /// Write a UTF-8 string
    pub fn write_utf(&mut self, s: &str) -> Result<()> {
        self.write_len(s.len())?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Write an optional string as a presence flag followed by the string
    pub fn write_opt_utf(&mut self, s: Option<&str>) -> Result<()> {
        match s {
            Some(s) => {
                self.write_bool(true);
                self.write_utf(s)
            }
            None => {
                self.write_bool(false);
                Ok(())
            }
        }
    }

    pub fn write_byte_array(&mut self, data: &[u8]) -> Result<()> {
        self.write_len(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn write_int_array(&mut self, values: &[i32]) -> Result<()> {
        self.write_len(values.len())?;
        for v in values {
            self.buf.put_i32_le(*v);
        }
        Ok(())
    }

    pub fn write_long_array(&mut self, values: &[i64]) -> Result<()> {
        self.write_len(values.len())?;
        for v in values {
            self.buf.put_i64_le(*v);
        }
        Ok(())
    }

    pub fn write_string_array<S: AsRef<str>>(&mut self, values: &[S]) -> Result<()> {
        self.write_len(values.len())?;
        for v in values {
            self.write_utf(v.as_ref())?;
        }
        Ok(())
    }

    /// Write a client unit id in the target layer's numbering
    pub fn write_unit_id(&mut self, id: UnitId) -> Result<()> {
        let id = match &self.translator {
            Some(t) => t
                .unit_to_layer(id)
                .ok_or_else(|| Error::codec(format!("unit {id} has no id in target layer")))?,
            None => id,
        };
        self.buf.put_u32_le(id.get());
        Ok(())
    }

    /// Write a client filesystem id in the target layer's numbering
    pub fn write_fs_id(&mut self, id: FsId) -> Result<()> {
        let id = match &self.translator {
            Some(t) => t
                .fs_to_layer(id)
                .ok_or_else(|| Error::codec(format!("filesystem {id} has no id in target layer")))?,
            None => id,
        };
        self.buf.put_u32_le(id.get());
        Ok(())
    }
}

/// Input stream an object is decoded from
pub struct RepositoryDataInput {
    buf: Bytes,
    translator: Option<Arc<dyn IdTranslator>>,
}

impl RepositoryDataInput {
    /// Create an input stream that reads ids unchanged
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            translator: None,
        }
    }

    /// Create an input stream that translates ids from a layer's numbering
    #[must_use]
    pub fn with_translator(buf: Bytes, translator: Arc<dyn IdTranslator>) -> Self {
        Self {
            buf,
            translator: Some(translator),
        }
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::codec(format!(
                "unexpected end of stream reading {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::codec(format!("invalid bool byte {v}"))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4, "i32")?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8, "f64")?;
        Ok(self.buf.get_f64_le())
    }

    /// Read a length prefix and check that `elem_size * len` bytes follow
    fn read_len(&mut self, elem_size: usize, what: &str) -> Result<usize> {
        let len = self.read_u32()? as usize;
        self.ensure(len.saturating_mul(elem_size), what)?;
        Ok(len)
    }

    pub fn read_utf(&mut self) -> Result<String> {
        let len = self.read_len(1, "string")?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|e| Error::codec(format!("invalid UTF-8: {e}")))
    }

    pub fn read_opt_utf(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            self.read_utf().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read a byte array without copying the underlying buffer
    pub fn read_byte_array(&mut self) -> Result<Bytes> {
        let len = self.read_len(1, "byte array")?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_int_array(&mut self) -> Result<Vec<i32>> {
        let len = self.read_len(4, "int array")?;
        Ok((0..len).map(|_| self.buf.get_i32_le()).collect())
    }

    pub fn read_long_array(&mut self) -> Result<Vec<i64>> {
        let len = self.read_len(8, "long array")?;
        Ok((0..len).map(|_| self.buf.get_i64_le()).collect())
    }

    pub fn read_string_array(&mut self) -> Result<Vec<String>> {
        // each element carries at least its own u32 length prefix
        let len = self.read_len(4, "string array")?;
        (0..len).map(|_| self.read_utf()).collect()
    }

    /// Read a layer unit id and translate it into the client numbering
    pub fn read_unit_id(&mut self) -> Result<UnitId> {
        let id = UnitId::new(self.read_u32()?);
        match &self.translator {
            Some(t) => t
                .unit_to_client(id)
                .ok_or_else(|| Error::codec(format!("layer unit {id} is unknown"))),
            None => Ok(id),
        }
    }

    /// Read a layer filesystem id and translate it into the client numbering
    pub fn read_fs_id(&mut self) -> Result<FsId> {
        let id = FsId::new(self.read_u32()?);
        match &self.translator {
            Some(t) => t
                .fs_to_client(id)
                .ok_or_else(|| Error::codec(format!("layer filesystem {id} is unknown"))),
            None => Ok(id),
        }
    }
}
