use std::collections::BTreeMap;

use super::{CodecError, FileKind};
use crate::id::{FileId, ID_LEN};

/// Longest name a directory entry may carry, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// One persisted directory record: name -> (identifier, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub id: FileId,
    pub kind: FileKind,
}

/// Serialize directory entries as `(name_len u16, name, id, kind u8)` records.
///
/// The output is plaintext; callers write it through the directory's
/// encrypted content stream.
pub fn encode_entries(entries: &BTreeMap<String, DirEntry>) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * (2 + 16 + ID_LEN + 1));
    for (name, entry) in entries {
        debug_assert!(name.len() <= MAX_NAME_LEN);
        let name_len = u16::try_from(name.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(entry.id.as_bytes());
        out.push(entry.kind.to_byte());
    }
    out
}

/// Parse directory records produced by [`encode_entries`].
pub fn decode_entries(dir: FileId, bytes: &[u8]) -> Result<BTreeMap<String, DirEntry>, CodecError> {
    let malformed = |reason: String| CodecError::Malformed { id: dir, reason };
    let mut entries = BTreeMap::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let header = bytes
            .get(pos..pos + 2)
            .ok_or_else(|| malformed(format!("truncated record at {pos}")))?;
        let name_len = usize::from(u16::from_le_bytes([header[0], header[1]]));
        pos += 2;
        let record = bytes
            .get(pos..pos + name_len + ID_LEN + 1)
            .ok_or_else(|| malformed(format!("truncated record at {pos}")))?;
        let name = std::str::from_utf8(&record[..name_len])
            .map_err(|_| malformed(format!("non UTF-8 name at {pos}")))?;
        let id = FileId::from_slice(&record[name_len..name_len + ID_LEN])
            .ok_or_else(|| malformed("bad id".to_string()))?;
        let kind = FileKind::from_byte(record[name_len + ID_LEN])
            .ok_or_else(|| malformed(format!("unknown kind for {name:?}")))?;
        if entries.insert(name.to_string(), DirEntry { id, kind }).is_some() {
            return Err(malformed(format!("duplicate name {name:?}")));
        }
        pos += record.len();
    }
    Ok(entries)
}
