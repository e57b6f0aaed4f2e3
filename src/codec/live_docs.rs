//! Deleted-document bitmaps
//!
//! Each deletion generation of a segment gets its own immutable file
//! `_N_G.liv` holding a serialized roaring bitmap of deleted docs. Older
//! generations stay readable for as long as a commit references them.

use std::io;

use roaring::RoaringBitmap;

use super::format::{check_file, ChecksumOutput};
use crate::directory::Directory;
use crate::error::{Result, TesseraError};
use crate::index::file_names::live_docs_file_name;

const CODEC: &str = "TesseraLiveDocs";
const VERSION: u32 = 1;

pub(super) fn write_live_docs(
    dir: &dyn Directory,
    segment: &str,
    del_gen: u64,
    deleted: &RoaringBitmap,
) -> io::Result<String> {
    let name = live_docs_file_name(segment, del_gen);
    let mut out = ChecksumOutput::create(dir.create_output(&name)?, CODEC, VERSION)?;
    deleted.serialize_into(&mut out)?;
    out.finish()?;
    Ok(name)
}

pub(super) fn read_live_docs(
    dir: &dyn Directory,
    segment: &str,
    del_gen: u64,
    max_doc: u32,
) -> Result<RoaringBitmap> {
    let name = live_docs_file_name(segment, del_gen);
    let data = dir.open_input(&name)?;
    let corrupt = |reason: String| TesseraError::CorruptSegment {
        segment: segment.to_string(),
        reason: format!("{}: {}", name, reason),
    };
    let body = check_file(&data, CODEC, VERSION).map_err(corrupt)?;
    let deleted = RoaringBitmap::deserialize_from(&body[..]).map_err(|e| corrupt(e.to_string()))?;
    if let Some(max) = deleted.max() {
        if max >= max_doc {
            return Err(corrupt(format!(
                "deleted doc {} beyond max_doc {}",
                max, max_doc
            )));
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;

    #[test]
    fn test_generations_are_separate_files() {
        let dir = RamDirectory::new();
        let mut deleted: RoaringBitmap = [1u32, 5].into_iter().collect();
        assert_eq!(write_live_docs(&dir, "_0", 1, &deleted).unwrap(), "_0_1.liv");
        deleted.insert(7);
        assert_eq!(write_live_docs(&dir, "_0", 2, &deleted).unwrap(), "_0_2.liv");

        assert_eq!(read_live_docs(&dir, "_0", 1, 10).unwrap().len(), 2);
        assert_eq!(read_live_docs(&dir, "_0", 2, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_rejects_out_of_range_docs() {
        let dir = RamDirectory::new();
        let deleted: RoaringBitmap = [9u32].into_iter().collect();
        write_live_docs(&dir, "_3", 1, &deleted).unwrap();
        match read_live_docs(&dir, "_3", 1, 5) {
            Err(TesseraError::CorruptSegment { segment, .. }) => assert_eq!(segment, "_3"),
            other => panic!("expected CorruptSegment, got {:?}", other),
        }
    }
}
