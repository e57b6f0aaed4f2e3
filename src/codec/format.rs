//! File header and checksum footer shared by every index file
//!
//! Layout: `magic | codec name | version | body | footer magic | crc32`.
//! The crc covers every byte before it, so truncation and bit flips are
//! both caught when the file is opened.

use std::io::{self, Write};

use bytes::Bytes;
use crc32fast::Hasher;

use crate::directory::IndexOutput;

pub const CODEC_MAGIC: u32 = 0x3fd7_6c17;
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;
pub const FOOTER_LENGTH: usize = 8;

/// Output that tracks a running crc32 of everything written
pub struct ChecksumOutput {
    out: Box<dyn IndexOutput>,
    hasher: Hasher,
}

impl ChecksumOutput {
    pub fn new(out: Box<dyn IndexOutput>) -> Self {
        Self {
            out,
            hasher: Hasher::new(),
        }
    }

    /// Start a file with its header
    pub fn create(out: Box<dyn IndexOutput>, codec: &str, version: u32) -> io::Result<Self> {
        let mut output = Self::new(out);
        output.write_header(codec, version)?;
        Ok(output)
    }

    pub fn write_header(&mut self, codec: &str, version: u32) -> io::Result<()> {
        let name = codec.as_bytes();
        if name.len() > u8::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Codec name too long",
            ));
        }
        self.write_all(&CODEC_MAGIC.to_le_bytes())?;
        self.write_all(&[name.len() as u8])?;
        self.write_all(name)?;
        self.write_all(&version.to_le_bytes())
    }

    pub fn name(&self) -> &str {
        self.out.name()
    }

    /// Write the footer and close the file. Returns the file length.
    pub fn finish(mut self) -> io::Result<u64> {
        self.write_all(&FOOTER_MAGIC.to_le_bytes())?;
        let crc = self.hasher.clone().finalize();
        self.out.write_all(&crc.to_le_bytes())?;
        let length = self.out.bytes_written();
        self.out.close()?;
        Ok(length)
    }
}

impl Write for ChecksumOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.out.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Verify header and footer of a whole file and return the body bytes.
/// The error is a human-readable reason for the caller to wrap.
pub fn check_file(data: &Bytes, codec: &str, version: u32) -> Result<Bytes, String> {
    let name = codec.as_bytes();
    let header_len = 4 + 1 + name.len() + 4;
    if data.len() < header_len + FOOTER_LENGTH {
        return Err(format!("file too short ({} bytes)", data.len()));
    }

    let magic = read_u32(data, 0);
    if magic != CODEC_MAGIC {
        return Err(format!("bad header magic {:#x}", magic));
    }
    let name_len = data[4] as usize;
    if name_len != name.len() || &data[5..5 + name_len] != name {
        let end = (5 + name_len).min(data.len());
        return Err(format!(
            "codec mismatch: expected {}, found {}",
            codec,
            String::from_utf8_lossy(&data[5..end])
        ));
    }
    let found_version = read_u32(data, 5 + name_len);
    if found_version != version {
        return Err(format!(
            "unsupported version {} (expected {})",
            found_version, version
        ));
    }

    let footer_start = data.len() - FOOTER_LENGTH;
    let footer_magic = read_u32(data, footer_start);
    if footer_magic != FOOTER_MAGIC {
        return Err(format!("bad footer magic {:#x}", footer_magic));
    }
    let expected = read_u32(data, footer_start + 4);
    let mut hasher = Hasher::new();
    hasher.update(&data[..footer_start + 4]);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(format!(
            "checksum mismatch: expected {:#010x}, actual {:#010x}",
            expected, actual
        ));
    }

    Ok(data.slice(header_len..footer_start))
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, RamDirectory};

    fn write_sample(dir: &RamDirectory, name: &str, body: &[u8]) {
        let mut out = ChecksumOutput::create(dir.create_output(name).unwrap(), "Test", 1).unwrap();
        out.write_all(body).unwrap();
        out.finish().unwrap();
    }

    #[test]
    fn test_header_footer() {
        let dir = RamDirectory::new();
        write_sample(&dir, "f", b"payload");

        let data = dir.open_input("f").unwrap();
        let body = check_file(&data, "Test", 1).unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[test]
    fn test_detects_bit_flip() {
        let dir = RamDirectory::new();
        write_sample(&dir, "f", b"payload");

        let mut data = dir.open_input("f").unwrap().to_vec();
        let middle = data.len() / 2;
        data[middle] ^= 0x01;
        let err = check_file(&Bytes::from(data), "Test", 1).unwrap_err();
        assert!(err.contains("checksum mismatch"), "{}", err);
    }

    #[test]
    fn test_detects_truncation_and_wrong_codec() {
        let dir = RamDirectory::new();
        write_sample(&dir, "f", b"payload");
        let data = dir.open_input("f").unwrap();

        assert!(check_file(&data.slice(..data.len() - 3), "Test", 1).is_err());
        assert!(check_file(&data, "Other", 1).is_err());
        assert!(check_file(&data, "Test", 2).is_err());
    }
}
