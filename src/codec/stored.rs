//! Stored fields
//!
//! Layout: `doc 0 | doc 1 | ... | offsets (u64 LE each) | count (u32 LE)`.
//! Each document is bincode-encoded; the trailing offset table gives
//! random access without scanning.

use std::io;

use bytes::Bytes;

use crate::models::StoredDocument;

/// Accumulates stored documents in doc order
#[derive(Debug, Default)]
pub struct StoredFieldsWriter {
    body: Vec<u8>,
    offsets: Vec<u64>,
}

impl StoredFieldsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, doc: &StoredDocument) -> io::Result<()> {
        self.offsets.push(self.body.len() as u64);
        bincode::serialize_into(&mut self.body, doc)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn finish(mut self) -> Vec<u8> {
        for offset in &self.offsets {
            self.body.extend_from_slice(&offset.to_le_bytes());
        }
        self.body
            .extend_from_slice(&(self.offsets.len() as u32).to_le_bytes());
        self.body
    }
}

/// Random-access reader over a stored fields body
#[derive(Clone, Debug)]
pub struct StoredFieldsReader {
    data: Bytes,
    offsets: Vec<u64>,
    body_len: u64,
}

impl StoredFieldsReader {
    pub fn open(data: Bytes) -> io::Result<Self> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        if data.len() < 4 {
            return Err(invalid("stored fields too short"));
        }
        let count_at = data.len() - 4;
        let mut count_bytes = [0u8; 4];
        count_bytes.copy_from_slice(&data[count_at..]);
        let count = u32::from_le_bytes(count_bytes) as usize;

        let table_len = count
            .checked_mul(8)
            .filter(|len| *len <= count_at)
            .ok_or_else(|| invalid("stored fields offset table truncated"))?;
        let table_start = count_at - table_len;

        let mut offsets = Vec::with_capacity(count);
        for chunk in data[table_start..count_at].chunks_exact(8) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            let offset = u64::from_le_bytes(bytes);
            if offset > table_start as u64 || offsets.last().map_or(false, |last| offset < *last) {
                return Err(invalid("stored fields offsets out of order"));
            }
            offsets.push(offset);
        }

        Ok(Self {
            data,
            offsets,
            body_len: table_start as u64,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn document(&self, doc: u32) -> io::Result<StoredDocument> {
        let idx = doc as usize;
        let start = *self.offsets.get(idx).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("doc {} out of range (max_doc {})", doc, self.offsets.len()),
            )
        })?;
        let end = self.offsets.get(idx + 1).copied().unwrap_or(self.body_len);
        bincode::deserialize(&self.data[start as usize..end as usize])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
