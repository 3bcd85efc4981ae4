use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aead::Payload;
use aes_gcm::{
    Nonce,
    aead::Aead,
};
use rand::RngCore;
use tracing::error;
use zeroize::Zeroizing;

use super::content::cipher_for;
use super::{CodecError, FileKind, NONCE_LEN};
use crate::id::{FileId, ID_LEN};
use crate::key::KEY_LEN;

const META_AAD_SUFFIX: &[u8] = b"meta";

/// Persisted attributes of one object.
///
/// Size is not stored here; it is derived from the content stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Full `st_mode`, including the `S_IFMT` type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Metadata {
    /// Fresh metadata for a new object; timestamps are set to now.
    pub fn new(kind: FileKind, perm: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            mode: kind.type_bits() | (perm & 0o7777),
            uid,
            gid,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            xattrs: BTreeMap::new(),
        }
    }

    /// Permission bits without the type.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.nlink.to_le_bytes());
        for time in [self.atime, self.mtime, self.ctime] {
            let (secs, nanos) = split_time(time);
            out.extend_from_slice(&secs.to_le_bytes());
            out.extend_from_slice(&nanos.to_le_bytes());
        }
        let count = u32::try_from(self.xattrs.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&count.to_le_bytes());
        for (name, value) in &self.xattrs {
            let name_len = u16::try_from(name.len()).unwrap_or(u16::MAX);
            out.extend_from_slice(&name_len.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            let value_len = u32::try_from(value.len()).unwrap_or(u32::MAX);
            out.extend_from_slice(&value_len.to_le_bytes());
            out.extend_from_slice(value);
        }
        out
    }

    fn decode(id: FileId, bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader { id, bytes, pos: 0 };
        let mode = reader.u32()?;
        let uid = reader.u32()?;
        let gid = reader.u32()?;
        let nlink = reader.u32()?;
        let mut times = [UNIX_EPOCH; 3];
        for time in &mut times {
            let secs = reader.i64()?;
            let nanos = reader.u32()?;
            *time = join_time(secs, nanos);
        }
        let count = reader.u32()?;
        let mut xattrs = BTreeMap::new();
        for _ in 0..count {
            let name_len = usize::from(reader.u16()?);
            let name = String::from_utf8(reader.take(name_len)?.to_vec())
                .map_err(|_| reader.malformed("xattr name is not UTF-8"))?;
            let value_len = reader.u32()? as usize;
            let value = reader.take(value_len)?.to_vec();
            xattrs.insert(name, value);
        }
        if reader.pos != bytes.len() {
            return Err(reader.malformed("trailing bytes"));
        }
        let [atime, mtime, ctime] = times;
        Ok(Self {
            mode,
            uid,
            gid,
            nlink,
            atime,
            mtime,
            ctime,
            xattrs,
        })
    }
}

/// Seal metadata for storage: `nonce || AES-GCM(record)` with AAD `id || "meta"`.
pub fn seal_metadata(
    meta: &Metadata,
    id: FileId,
    key: &Zeroizing<[u8; KEY_LEN]>,
) -> Result<Vec<u8>, CodecError> {
    let plain = Zeroizing::new(meta.encode());
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let aad = meta_aad(&id);
    let sealed = cipher_for(key)
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plain,
                aad: &aad,
            },
        )
        .map_err(|_| CodecError::Encryption { id })?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a sealed metadata record.
pub fn open_metadata(
    raw: &[u8],
    id: FileId,
    key: &Zeroizing<[u8; KEY_LEN]>,
) -> Result<Metadata, CodecError> {
    if raw.len() < NONCE_LEN {
        error!(id = %id, len = raw.len(), "Metadata stream too short");
        return Err(CodecError::MetaIntegrity { id });
    }
    let (nonce, sealed) = raw.split_at(NONCE_LEN);
    let aad = meta_aad(&id);
    let plain = cipher_for(key)
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: &aad,
            },
        )
        .map_err(|_| {
            error!(id = %id, "Metadata authentication failed");
            CodecError::MetaIntegrity { id }
        })?;
    let plain = Zeroizing::new(plain);
    Metadata::decode(id, &plain)
}

fn meta_aad(id: &FileId) -> [u8; ID_LEN + 4] {
    let mut aad = [0u8; ID_LEN + 4];
    aad[..ID_LEN].copy_from_slice(id.as_bytes());
    aad[ID_LEN..].copy_from_slice(META_AAD_SUFFIX);
    aad
}

fn split_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (i64::try_from(d.as_secs()).unwrap_or(i64::MAX), d.subsec_nanos()),
        Err(e) => {
            // Before the epoch: floor to whole seconds, keep nanos positive.
            let d = e.duration();
            let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
            match d.subsec_nanos() {
                0 => (-secs, 0),
                n => (-secs - 1, 1_000_000_000 - n),
            }
        }
    }
}

fn join_time(secs: i64, nanos: u32) -> SystemTime {
    let nanos = Duration::from_nanos(u64::from(nanos.min(999_999_999)));
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs()) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

struct Reader<'a> {
    id: FileId,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| self.malformed("record truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    fn malformed(&self, reason: &str) -> CodecError {
        CodecError::Malformed {
            id: self.id,
            reason: reason.to_string(),
        }
    }
}
