//! Postings format with block-based compression
//!
//! Postings of a term are stored in blocks of [`BLOCK_SIZE`] docs:
//! - doc deltas: bitpacked
//! - freqs: bitpacked (omitted when the field indexes docs only)
//! - positions and offsets: vbyte stream after the block
//! - one skip entry per block (max doc, block offset) for `advance`

use std::io::{self, Write};

use bytes::Bytes;

use super::term_dict::TermMeta;
use super::{Posting, PostingsEnum, TermStats};
use crate::models::IndexOptions;

/// Docs per postings block
pub const BLOCK_SIZE: usize = 128;

/// Variable-byte encoding for integers (high bit marks the last byte)
pub fn encode_vbyte(value: u32, output: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            output.push(byte | 0x80);
            break;
        } else {
            output.push(byte);
        }
    }
}

/// Decode a variable-byte encoded integer
pub fn decode_vbyte(input: &[u8], pos: &mut usize) -> io::Result<u32> {
    let mut result: u32 = 0;
    let mut shift = 0;

    loop {
        if *pos >= input.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Unexpected end of vbyte",
            ));
        }

        let byte = input[*pos];
        *pos += 1;

        result |= ((byte & 0x7F) as u32) << shift;

        if byte & 0x80 != 0 {
            return Ok(result);
        }

        shift += 7;
        if shift > 28 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "VByte value too large",
            ));
        }
    }
}

/// Bitpack a block using the minimum width that fits its largest value
pub fn bitpack_encode(values: &[u32], output: &mut Vec<u8>) {
    let max_val = values.iter().copied().max().unwrap_or(0);
    if values.is_empty() || max_val == 0 {
        output.push(0);
        return;
    }

    let bits_needed = (32 - max_val.leading_zeros()) as u8;
    output.push(bits_needed);

    let mut current: u64 = 0;
    let mut bits_in_current = 0;

    for &value in values {
        current |= (value as u64) << bits_in_current;
        bits_in_current += bits_needed as u32;

        while bits_in_current >= 8 {
            output.push(current as u8);
            current >>= 8;
            bits_in_current -= 8;
        }
    }

    if bits_in_current > 0 {
        output.push(current as u8);
    }
}

/// Decode `count` bitpacked integers
pub fn bitpack_decode(input: &[u8], pos: &mut usize, count: usize) -> io::Result<Vec<u32>> {
    if *pos >= input.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Unexpected end of bitpack",
        ));
    }

    let bits_needed = input[*pos] as u32;
    *pos += 1;

    if bits_needed == 0 {
        return Ok(vec![0; count]);
    }
    if bits_needed > 32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Bitpack width too large",
        ));
    }

    let total_bits = count as u64 * bits_needed as u64;
    let bytes_needed = ((total_bits + 7) / 8) as usize;

    if *pos + bytes_needed > input.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Not enough bytes for bitpack",
        ));
    }

    let mut values = Vec::with_capacity(count);
    let mut current: u64 = 0;
    let mut bits_available = 0;
    let mask = (1u64 << bits_needed) - 1;
    let end = *pos + bytes_needed;

    for _ in 0..count {
        while bits_available < bits_needed {
            if *pos < end {
                current |= (input[*pos] as u64) << bits_available;
                *pos += 1;
            }
            bits_available += 8;
        }

        values.push((current & mask) as u32);
        current >>= bits_needed;
        bits_available -= bits_needed;
    }

    *pos = end;
    Ok(values)
}

/// Skip data for jumping over whole blocks
#[derive(Clone, Debug, Default)]
struct SkipEntry {
    /// Largest doc in the block
    max_doc: u32,
    /// Offset of the block from the start of the block area
    block_offset: u32,
}

/// Writes the postings of one term after another into `out`
pub struct PostingsWriter<W: Write> {
    out: W,
    /// Bytes written to `out` so far
    offset: u64,
    options: IndexOptions,
    block_data: Vec<u8>,
    skip_entries: Vec<SkipEntry>,
    docs: Vec<u32>,
    freqs: Vec<u32>,
    positions: Vec<u8>,
    /// Last doc of the previous block, the base for delta coding
    last_doc: u32,
    last_added: Option<u32>,
    scratch: Vec<u8>,
}

impl<W: Write> PostingsWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            options: IndexOptions::DocsAndFreqs,
            block_data: Vec::new(),
            skip_entries: Vec::new(),
            docs: Vec::with_capacity(BLOCK_SIZE),
            freqs: Vec::with_capacity(BLOCK_SIZE),
            positions: Vec::new(),
            last_doc: 0,
            last_added: None,
            scratch: Vec::new(),
        }
    }

    /// Start writing a new posting list
    pub fn start_term(&mut self, options: IndexOptions) {
        self.options = options;
        self.reset();
    }

    /// Add a posting to the current list. Docs must be strictly increasing.
    pub fn add(&mut self, posting: &Posting) -> io::Result<()> {
        if let Some(last) = self.last_added {
            if posting.doc <= last {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("postings out of order: {} after {}", posting.doc, last),
                ));
            }
        }
        if self.options.has_positions() && posting.positions.len() != posting.freq as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "doc {} has freq {} but {} positions",
                    posting.doc,
                    posting.freq,
                    posting.positions.len()
                ),
            ));
        }
        self.last_added = Some(posting.doc);
        self.docs.push(posting.doc);
        self.freqs.push(posting.freq.max(1));

        if self.options.has_positions() {
            let mut prev_pos = 0u32;
            let mut prev_start = 0u32;
            for (i, &pos) in posting.positions.iter().enumerate() {
                encode_vbyte(pos.saturating_sub(prev_pos), &mut self.positions);
                prev_pos = pos;
                if self.options.has_offsets() {
                    let (start, end) = posting.offsets.get(i).copied().unwrap_or((prev_start, prev_start));
                    encode_vbyte(start.saturating_sub(prev_start), &mut self.positions);
                    encode_vbyte(end.saturating_sub(start), &mut self.positions);
                    prev_start = start;
                }
            }
        }

        if self.docs.len() == BLOCK_SIZE {
            self.flush_block();
        }
        Ok(())
    }

    /// Drop everything added since `start_term`
    pub fn abandon_term(&mut self) {
        self.reset();
    }

    /// Finish the current list and return where it was written
    pub fn finish_term(&mut self, stats: TermStats) -> io::Result<TermMeta> {
        if !self.docs.is_empty() {
            self.flush_block();
        }

        self.scratch.clear();
        encode_vbyte(self.skip_entries.len() as u32, &mut self.scratch);
        for skip in &self.skip_entries {
            encode_vbyte(skip.max_doc, &mut self.scratch);
            encode_vbyte(skip.block_offset, &mut self.scratch);
        }

        let offset = self.offset;
        self.out.write_all(&self.scratch)?;
        self.out.write_all(&self.block_data)?;
        let length = (self.scratch.len() + self.block_data.len()) as u64;
        self.offset += length;
        self.reset();

        Ok(TermMeta {
            doc_freq: stats.doc_freq,
            total_term_freq: stats.total_term_freq,
            offset,
            length,
        })
    }

    /// Bytes written so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn reset(&mut self) {
        self.block_data.clear();
        self.skip_entries.clear();
        self.docs.clear();
        self.freqs.clear();
        self.positions.clear();
        self.last_doc = 0;
        self.last_added = None;
    }

    fn flush_block(&mut self) {
        if self.docs.is_empty() {
            return;
        }

        let max_doc = *self.docs.last().unwrap_or(&0);
        self.skip_entries.push(SkipEntry {
            max_doc,
            block_offset: self.block_data.len() as u32,
        });

        encode_vbyte(self.docs.len() as u32, &mut self.block_data);

        let mut deltas = Vec::with_capacity(self.docs.len());
        let mut prev = self.last_doc;
        for &doc in &self.docs {
            deltas.push(doc - prev);
            prev = doc;
        }
        bitpack_encode(&deltas, &mut self.block_data);

        if self.options.has_freqs() {
            bitpack_encode(&self.freqs, &mut self.block_data);
        }

        if self.options.has_positions() {
            encode_vbyte(self.positions.len() as u32, &mut self.block_data);
            self.block_data.extend_from_slice(&self.positions);
        }

        self.last_doc = max_doc;
        self.docs.clear();
        self.freqs.clear();
        self.positions.clear();
    }
}

/// Iterator over the postings of one term
pub struct BlockPostingsEnum {
    data: Bytes,
    options: IndexOptions,
    blocks_start: usize,
    pos: usize,
    skip_entries: Vec<SkipEntry>,
    /// Index of the next block to load
    next_block: usize,
    block: Vec<Posting>,
    block_pos: usize,
    last_doc: u32,
}

impl BlockPostingsEnum {
    /// `data` holds exactly one term's postings
    pub fn new(data: Bytes, options: IndexOptions) -> io::Result<Self> {
        let mut pos = 0;
        let block_count = decode_vbyte(&data, &mut pos)? as usize;

        let mut skip_entries = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let max_doc = decode_vbyte(&data, &mut pos)?;
            let block_offset = decode_vbyte(&data, &mut pos)?;
            skip_entries.push(SkipEntry {
                max_doc,
                block_offset,
            });
        }

        Ok(Self {
            data,
            options,
            blocks_start: pos,
            pos,
            skip_entries,
            next_block: 0,
            block: Vec::new(),
            block_pos: 0,
            last_doc: 0,
        })
    }

    /// Read the postings of `meta` out of a whole postings file body
    pub fn for_term(postings: &Bytes, meta: &TermMeta, options: IndexOptions) -> io::Result<Self> {
        let start = meta.offset as usize;
        let end = (meta.offset + meta.length) as usize;
        if end > postings.len() || start > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Posting list extends beyond data",
            ));
        }
        Self::new(postings.slice(start..end), options)
    }

    fn load_next_block(&mut self) -> io::Result<bool> {
        if self.next_block >= self.skip_entries.len() {
            return Ok(false);
        }

        let data = &self.data[..];
        let count = decode_vbyte(data, &mut self.pos)? as usize;
        if count == 0 || count > BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Bad postings block size {}", count),
            ));
        }

        let deltas = bitpack_decode(data, &mut self.pos, count)?;
        let freqs = if self.options.has_freqs() {
            bitpack_decode(data, &mut self.pos, count)?
        } else {
            vec![1; count]
        };

        self.block.clear();
        let mut doc = self.last_doc;
        for i in 0..count {
            doc = doc.checked_add(deltas[i]).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "Doc id overflow in postings")
            })?;
            self.block.push(Posting::new(doc, freqs[i]));
        }

        if self.options.has_positions() {
            let len = decode_vbyte(data, &mut self.pos)? as usize;
            let end = self.pos + len;
            if end > data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Positions extend beyond postings",
                ));
            }
            let mut p = self.pos;
            for posting in self.block.iter_mut() {
                let mut position = 0u32;
                let mut start = 0u32;
                for _ in 0..posting.freq {
                    position += decode_vbyte(&data[..end], &mut p)?;
                    posting.positions.push(position);
                    if self.options.has_offsets() {
                        start += decode_vbyte(&data[..end], &mut p)?;
                        let length = decode_vbyte(&data[..end], &mut p)?;
                        posting.offsets.push((start, start + length));
                    }
                }
            }
            self.pos = end;
        }

        self.last_doc = doc;
        self.block_pos = 0;
        self.next_block += 1;
        Ok(true)
    }
}

impl PostingsEnum for BlockPostingsEnum {
    fn next(&mut self) -> io::Result<Option<Posting>> {
        if self.block_pos >= self.block.len() && !self.load_next_block()? {
            return Ok(None);
        }
        let posting = std::mem::take(&mut self.block[self.block_pos]);
        self.block_pos += 1;
        Ok(Some(posting))
    }

    fn advance(&mut self, target: u32) -> io::Result<Option<Posting>> {
        // Skip whole blocks whose max doc is below the target
        let mut skip_to = self.next_block;
        while skip_to < self.skip_entries.len() && self.skip_entries[skip_to].max_doc < target {
            skip_to += 1;
        }
        if skip_to > self.next_block {
            if skip_to >= self.skip_entries.len() {
                self.next_block = skip_to;
                self.block.clear();
                self.block_pos = 0;
                return Ok(None);
            }
            self.pos = self.blocks_start + self.skip_entries[skip_to].block_offset as usize;
            self.last_doc = self.skip_entries[skip_to - 1].max_doc;
            self.next_block = skip_to;
            self.block.clear();
            self.block_pos = 0;
        }

        while let Some(posting) = self.next()? {
            if posting.doc >= target {
                return Ok(Some(posting));
            }
        }
        Ok(None)
    }
}
