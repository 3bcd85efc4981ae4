use std::fs::File;
use std::os::unix::fs::FileExt;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use tracing::{error, instrument, trace};
use zeroize::Zeroizing;

use super::{CodecError, FileKind, NONCE_LEN, TAG_LEN};
use crate::id::{FileId, ID_LEN};
use crate::key::KEY_LEN;

/// Plaintext bytes per chunk.
pub const CHUNK_SIZE: u64 = 4096;

/// Per-chunk overhead: nonce plus GCM tag.
pub const CHUNK_OVERHEAD: u64 = (NONCE_LEN + TAG_LEN) as u64;

/// Size of a full chunk on disk.
pub const RAW_CHUNK_SIZE: u64 = CHUNK_SIZE + CHUNK_OVERHEAD;

/// Size of the content header: magic, version, kind, reserved, id.
pub const HEADER_LEN: u64 = 8 + ID_LEN as u64;

const MAGIC: &[u8; 4] = b"OXFS";
const VERSION: u8 = 1;

/// Raw stream length holding `size` plaintext bytes.
pub fn raw_len_for_size(size: u64) -> u64 {
    let full = size / CHUNK_SIZE;
    let rem = size % CHUNK_SIZE;
    let tail = if rem == 0 { 0 } else { rem + CHUNK_OVERHEAD };
    HEADER_LEN + full * RAW_CHUNK_SIZE + tail
}

/// Plaintext size held by a raw stream of `raw_len` bytes, if well-formed.
fn size_for_raw_len(raw_len: u64) -> Option<u64> {
    let body = raw_len.checked_sub(HEADER_LEN)?;
    let full = body / RAW_CHUNK_SIZE;
    let rem = body % RAW_CHUNK_SIZE;
    match rem {
        0 => Some(full * CHUNK_SIZE),
        r if r <= CHUNK_OVERHEAD => None,
        r => Some(full * CHUNK_SIZE + r - CHUNK_OVERHEAD),
    }
}

/// Random-access view of one object's encrypted content stream.
///
/// Exclusively owned by a single in-memory file node. Writes go straight to
/// the raw file (re-sealing every touched chunk), so there is no buffered
/// plaintext to lose on eviction.
pub struct ContentStream {
    file: File,
    id: FileId,
    kind: FileKind,
    cipher: Aes256Gcm,
    size: u64,
}

impl std::fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl ContentStream {
    /// Initialize a new, empty stream in `file` by writing its header.
    pub fn create(
        file: File,
        id: FileId,
        kind: FileKind,
        key: &Zeroizing<[u8; KEY_LEN]>,
    ) -> Result<Self, CodecError> {
        let mut header = [0u8; HEADER_LEN as usize];
        header[..4].copy_from_slice(MAGIC);
        header[4] = VERSION;
        header[5] = kind.to_byte();
        header[8..].copy_from_slice(id.as_bytes());
        file.set_len(0)?;
        file.write_all_at(&header, 0)?;
        Ok(Self {
            file,
            id,
            kind,
            cipher: cipher_for(key),
            size: 0,
        })
    }

    /// Open an existing stream, validating that its header names `id`.
    pub fn open(
        file: File,
        id: FileId,
        key: &Zeroizing<[u8; KEY_LEN]>,
    ) -> Result<Self, CodecError> {
        let raw_len = file.metadata()?.len();
        let mut header = [0u8; HEADER_LEN as usize];
        if raw_len < HEADER_LEN {
            return Err(invalid_header(id, format!("stream too short: {raw_len} bytes")));
        }
        file.read_exact_at(&mut header, 0)?;

        if &header[..4] != MAGIC {
            return Err(invalid_header(id, "bad magic".to_string()));
        }
        if header[4] != VERSION {
            return Err(invalid_header(id, format!("unsupported version {}", header[4])));
        }
        let kind = FileKind::from_byte(header[5])
            .ok_or_else(|| invalid_header(id, format!("unknown kind {}", header[5])))?;
        if &header[8..] != id.as_bytes() {
            return Err(invalid_header(id, "header names a different object".to_string()));
        }
        let size = size_for_raw_len(raw_len)
            .ok_or_else(|| invalid_header(id, format!("truncated chunk (raw length {raw_len})")))?;

        Ok(Self {
            file,
            id,
            kind,
            cipher: cipher_for(key),
            size,
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Current plaintext size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at or past the end.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, CodecError> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let end = self.size.min(offset + buf.len() as u64);
        let mut pos = offset;
        while pos < end {
            let index = pos / CHUNK_SIZE;
            let plain = self.read_chunk(index)?;
            let chunk_start = index * CHUNK_SIZE;
            let from = usize::try_from(pos - chunk_start).unwrap_or(usize::MAX);
            let to = usize::try_from(end.min(chunk_start + CHUNK_SIZE) - chunk_start)
                .unwrap_or(usize::MAX);
            let dst = usize::try_from(pos - offset).unwrap_or(usize::MAX);
            buf[dst..dst + (to - from)].copy_from_slice(&plain[from..to]);
            pos = chunk_start + to as u64;
        }
        Ok(usize::try_from(end - offset).unwrap_or(usize::MAX))
    }

    /// Read the whole plaintext.
    pub fn read_all(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; usize::try_from(self.size).unwrap_or(usize::MAX)];
        let n = self.read(0, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    #[instrument(level = "trace", skip(self, data), fields(id = %self.id, len = data.len()))]
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), CodecError> {
        if data.is_empty() {
            return Ok(());
        }
        if offset > self.size {
            self.grow_to(offset)?;
        }
        let end = offset + data.len() as u64;
        let mut pos = offset;
        while pos < end {
            let index = pos / CHUNK_SIZE;
            let chunk_start = index * CHUNK_SIZE;
            let mut plain = if chunk_start < self.size {
                self.read_chunk(index)?
            } else {
                Zeroizing::new(Vec::new())
            };
            let from = usize::try_from(pos - chunk_start).unwrap_or(usize::MAX);
            let to = usize::try_from(end.min(chunk_start + CHUNK_SIZE) - chunk_start)
                .unwrap_or(usize::MAX);
            if plain.len() < to {
                plain.resize(to, 0);
            }
            let src = usize::try_from(pos - offset).unwrap_or(usize::MAX);
            plain[from..to].copy_from_slice(&data[src..src + (to - from)]);
            self.write_chunk(index, &plain)?;
            pos = chunk_start + to as u64;
        }
        self.size = self.size.max(end);
        Ok(())
    }

    /// Resize to `new_size`: shrinking drops trailing chunks, growing zero-fills.
    pub fn resize(&mut self, new_size: u64) -> Result<(), CodecError> {
        if new_size > self.size {
            return self.grow_to(new_size);
        }
        if new_size == self.size {
            return Ok(());
        }
        let rem = new_size % CHUNK_SIZE;
        if rem != 0 {
            let index = new_size / CHUNK_SIZE;
            let mut plain = self.read_chunk(index)?;
            plain.truncate(usize::try_from(rem).unwrap_or(usize::MAX));
            self.write_chunk(index, &plain)?;
        }
        self.file.set_len(raw_len_for_size(new_size))?;
        trace!(id = %self.id, old = self.size, new = new_size, "Content truncated");
        self.size = new_size;
        Ok(())
    }

    /// Flush written data to stable storage.
    pub fn sync(&self, data_only: bool) -> Result<(), CodecError> {
        if data_only {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn grow_to(&mut self, new_size: u64) -> Result<(), CodecError> {
        let mut index = self.size / CHUNK_SIZE;
        while index * CHUNK_SIZE < new_size {
            let chunk_start = index * CHUNK_SIZE;
            let mut plain = if chunk_start < self.size {
                self.read_chunk(index)?
            } else {
                Zeroizing::new(Vec::new())
            };
            let target = usize::try_from(new_size.min(chunk_start + CHUNK_SIZE) - chunk_start)
                .unwrap_or(usize::MAX);
            plain.resize(target, 0);
            self.write_chunk(index, &plain)?;
            index += 1;
        }
        self.size = new_size;
        Ok(())
    }

    fn chunk_plain_len(&self, index: u64) -> u64 {
        self.size.saturating_sub(index * CHUNK_SIZE).min(CHUNK_SIZE)
    }

    fn read_chunk(&self, index: u64) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        let plain_len = self.chunk_plain_len(index);
        let mut raw = vec![0u8; usize::try_from(plain_len + CHUNK_OVERHEAD).unwrap_or(usize::MAX)];
        self.file
            .read_exact_at(&mut raw, HEADER_LEN + index * RAW_CHUNK_SIZE)?;

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let aad = chunk_aad(&self.id, index);
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                error!(id = %self.id, chunk = index, "Chunk authentication failed");
                CodecError::Integrity {
                    id: self.id,
                    chunk: index,
                }
            })?;
        Ok(Zeroizing::new(plain))
    }

    fn write_chunk(&self, index: u64, plain: &[u8]) -> Result<(), CodecError> {
        debug_assert!(plain.len() as u64 <= CHUNK_SIZE);
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let aad = chunk_aad(&self.id, index);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plain,
                    aad: &aad,
                },
            )
            .map_err(|_| CodecError::Encryption { id: self.id })?;

        let mut raw = Vec::with_capacity(NONCE_LEN + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        self.file
            .write_all_at(&raw, HEADER_LEN + index * RAW_CHUNK_SIZE)?;
        Ok(())
    }
}

pub(super) fn cipher_for(key: &Zeroizing<[u8; KEY_LEN]>) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]))
}

/// AAD binds each chunk to its object and position: `id || index (u64 BE)`.
fn chunk_aad(id: &FileId, index: u64) -> [u8; ID_LEN + 8] {
    let mut aad = [0u8; ID_LEN + 8];
    aad[..ID_LEN].copy_from_slice(id.as_bytes());
    aad[ID_LEN..].copy_from_slice(&index.to_be_bytes());
    aad
}

fn invalid_header(id: FileId, reason: String) -> CodecError {
    error!(id = %id, reason = %reason, "Invalid content header");
    CodecError::InvalidHeader { id, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::MasterKey;
    use proptest::prelude::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn new_stream(dir: &TempDir, kind: FileKind) -> (ContentStream, MasterKey, std::path::PathBuf) {
        let key = MasterKey::generate();
        let id = FileId::random();
        let path = dir.path().join(id.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        let stream = ContentStream::create(file, id, kind, &key.derive_content_key(&id)).unwrap();
        (stream, key, path)
    }

    fn reopen(path: &std::path::Path, id: FileId, key: &MasterKey) -> Result<ContentStream, CodecError> {
        let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        ContentStream::open(file, id, &key.derive_content_key(&id))
    }

    #[test]
    fn empty_stream_is_header_only() {
        let dir = TempDir::new().unwrap();
        let (stream, _, path) = new_stream(&dir, FileKind::RegularFile);
        assert_eq!(stream.size(), 0);
        assert_eq!(std::fs::metadata(path).unwrap().len(), HEADER_LEN);
    }

    #[test]
    fn write_spanning_chunks_reads_back() {
        let dir = TempDir::new().unwrap();
        let (mut stream, key, path) = new_stream(&dir, FileKind::RegularFile);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        stream.write(0, &data).unwrap();
        assert_eq!(stream.size(), 10_000);

        let reopened = reopen(&path, stream.id(), &key).unwrap();
        assert_eq!(reopened.size(), 10_000);
        assert_eq!(reopened.read_all().unwrap(), data);

        let mut middle = [0u8; 100];
        assert_eq!(reopened.read(4090, &mut middle).unwrap(), 100);
        assert_eq!(&middle[..], &data[4090..4190]);
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let dir = TempDir::new().unwrap();
        let (mut stream, _, _) = new_stream(&dir, FileKind::RegularFile);
        stream.write(0, b"abc").unwrap();
        stream.write(9000, b"xyz").unwrap();
        assert_eq!(stream.size(), 9003);
        let all = stream.read_all().unwrap();
        assert_eq!(&all[..3], b"abc");
        assert!(all[3..9000].iter().all(|b| *b == 0));
        assert_eq!(&all[9000..], b"xyz");
    }

    #[test]
    fn shrink_drops_trailing_chunks() {
        let dir = TempDir::new().unwrap();
        let (mut stream, _, path) = new_stream(&dir, FileKind::RegularFile);
        stream.write(0, &vec![7u8; 3 * CHUNK_SIZE as usize]).unwrap();
        stream.resize(5000).unwrap();
        assert_eq!(stream.size(), 5000);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), raw_len_for_size(5000));
        assert_eq!(stream.read_all().unwrap(), vec![7u8; 5000]);

        stream.resize(6000).unwrap();
        let all = stream.read_all().unwrap();
        assert_eq!(&all[..5000], &vec![7u8; 5000][..]);
        assert!(all[5000..].iter().all(|b| *b == 0));
    }

    #[test]
    fn read_past_end_returns_zero() {
        let dir = TempDir::new().unwrap();
        let (mut stream, _, _) = new_stream(&dir, FileKind::RegularFile);
        stream.write(0, b"hello").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(5, &mut buf).unwrap(), 0);
        assert_eq!(stream.read(2, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"llo");
    }

    #[test]
    fn flipped_ciphertext_byte_is_an_integrity_error() {
        let dir = TempDir::new().unwrap();
        let (mut stream, key, path) = new_stream(&dir, FileKind::RegularFile);
        stream.write(0, &vec![1u8; 6000]).unwrap();
        let id = stream.id();
        drop(stream);

        // Corrupt one byte inside the second chunk's ciphertext.
        let mut raw = std::fs::read(&path).unwrap();
        let victim = (HEADER_LEN + RAW_CHUNK_SIZE + 20) as usize;
        raw[victim] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        let stream = reopen(&path, id, &key).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(stream.read(0, &mut buf).unwrap(), 10);
        let err = stream.read(CHUNK_SIZE + 5, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Integrity { chunk: 1, .. }));
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn header_for_another_object_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (stream, key, path) = new_stream(&dir, FileKind::Directory);
        drop(stream);
        let err = reopen(&path, FileId::random(), &key).unwrap_err();
        assert!(matches!(err, CodecError::InvalidHeader { .. }));
    }

    #[test]
    fn truncated_chunk_is_rejected_on_open() {
        let dir = TempDir::new().unwrap();
        let (mut stream, key, path) = new_stream(&dir, FileKind::RegularFile);
        stream.write(0, b"some content").unwrap();
        let id = stream.id();
        drop(stream);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(HEADER_LEN + 10).unwrap();
        assert!(matches!(
            reopen(&path, id, &key).unwrap_err(),
            CodecError::InvalidHeader { .. }
        ));
    }

    proptest! {
        #[test]
        fn raw_length_and_size_agree(size in 0u64..(1 << 24)) {
            prop_assert_eq!(size_for_raw_len(raw_len_for_size(size)), Some(size));
        }
    }
}
