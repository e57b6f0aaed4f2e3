//! Per-document columns
//!
//! - numeric: deltas from the column minimum, bitpacked when they fit in
//!   32 bits, raw otherwise
//! - binary: length-prefixed values
//! - missing values: explicit bitmap

use std::io;

use roaring::RoaringBitmap;

use super::postings::{bitpack_decode, bitpack_encode, decode_vbyte, encode_vbyte};

const PACKED: u8 = 1;
const RAW: u8 = 2;

/// Numeric doc values of one field
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NumericColumn {
    /// Values indexed by doc (None for missing values)
    values: Vec<Option<i64>>,
    missing: RoaringBitmap,
    min_value: Option<i64>,
    max_value: Option<i64>,
}

impl NumericColumn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Add a value for the next doc
    pub fn add(&mut self, value: Option<i64>) {
        let doc = self.values.len() as u32;
        match value {
            Some(v) => {
                self.min_value = Some(self.min_value.map_or(v, |m| m.min(v)));
                self.max_value = Some(self.max_value.map_or(v, |m| m.max(v)));
            }
            None => {
                self.missing.insert(doc);
            }
        }
        self.values.push(value);
    }

    pub fn get(&self, doc: u32) -> Option<i64> {
        self.values.get(doc as usize).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn min_value(&self) -> Option<i64> {
        self.min_value
    }

    pub fn max_value(&self) -> Option<i64> {
        self.max_value
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        encode_vbyte(self.values.len() as u32, &mut output);

        let mut missing = Vec::new();
        self.missing.serialize_into(&mut missing)?;
        encode_vbyte(missing.len() as u32, &mut output);
        output.extend(missing);

        let (min, max) = match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => (min, max),
            _ => {
                output.push(0);
                return Ok(output);
            }
        };

        // Differences are taken modulo 2^64 so the full i64 range round-trips
        let deltas = self
            .values
            .iter()
            .map(|v| v.map_or(0, |x| x.wrapping_sub(min) as u64));
        if (max.wrapping_sub(min) as u64) <= u32::MAX as u64 {
            output.push(PACKED);
            output.extend_from_slice(&min.to_le_bytes());
            let packed: Vec<u32> = deltas.map(|d| d as u32).collect();
            bitpack_encode(&packed, &mut output);
        } else {
            output.push(RAW);
            output.extend_from_slice(&min.to_le_bytes());
            for d in deltas {
                output.extend_from_slice(&d.to_le_bytes());
            }
        }
        Ok(output)
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let mut pos = 0;
        let count = decode_vbyte(data, &mut pos)? as usize;

        let missing_len = decode_vbyte(data, &mut pos)? as usize;
        let missing_bytes = take(data, &mut pos, missing_len)?;
        let missing = RoaringBitmap::deserialize_from(missing_bytes)?;

        let mode = take(data, &mut pos, 1)?[0];
        if mode == 0 {
            let mut column = Self::with_capacity(count);
            for _ in 0..count {
                column.add(None);
            }
            return Ok(column);
        }

        let min = i64::from_le_bytes(fixed(take(data, &mut pos, 8)?));
        let deltas: Vec<u64> = match mode {
            PACKED => bitpack_decode(data, &mut pos, count)?
                .into_iter()
                .map(u64::from)
                .collect(),
            RAW => {
                let mut deltas = Vec::with_capacity(count);
                for _ in 0..count {
                    deltas.push(u64::from_le_bytes(fixed(take(data, &mut pos, 8)?)));
                }
                deltas
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown numeric column encoding {}", other),
                ))
            }
        };

        let mut column = Self::with_capacity(count);
        for (doc, delta) in deltas.into_iter().enumerate() {
            if missing.contains(doc as u32) {
                column.add(None);
            } else {
                column.add(Some(min.wrapping_add(delta as i64)));
            }
        }
        Ok(column)
    }
}

/// Binary doc values of one field
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BinaryColumn {
    values: Vec<Option<Vec<u8>>>,
}

impl BinaryColumn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Option<Vec<u8>>) {
        self.values.push(value);
    }

    pub fn get(&self, doc: u32) -> Option<&[u8]> {
        self.values.get(doc as usize).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut missing = RoaringBitmap::new();
        for (doc, value) in self.values.iter().enumerate() {
            if value.is_none() {
                missing.insert(doc as u32);
            }
        }

        let mut output = Vec::new();
        encode_vbyte(self.values.len() as u32, &mut output);
        let mut missing_bytes = Vec::new();
        missing.serialize_into(&mut missing_bytes)?;
        encode_vbyte(missing_bytes.len() as u32, &mut output);
        output.extend(missing_bytes);

        for value in self.values.iter().flatten() {
            encode_vbyte(value.len() as u32, &mut output);
            output.extend_from_slice(value);
        }
        Ok(output)
    }

    pub fn deserialize(data: &[u8]) -> io::Result<Self> {
        let mut pos = 0;
        let count = decode_vbyte(data, &mut pos)? as usize;
        let missing_len = decode_vbyte(data, &mut pos)? as usize;
        let missing = RoaringBitmap::deserialize_from(take(data, &mut pos, missing_len)?)?;

        let mut values = Vec::with_capacity(count);
        for doc in 0..count {
            if missing.contains(doc as u32) {
                values.push(None);
                continue;
            }
            let len = decode_vbyte(data, &mut pos)? as usize;
            values.push(Some(take(data, &mut pos, len)?.to_vec()));
        }
        Ok(Self { values })
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> io::Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "doc values truncated"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn fixed(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}
