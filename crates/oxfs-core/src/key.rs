//! Repository master key and per-object key derivation.
//!
//! The master key never encrypts content directly. Every object gets its own
//! content key, `HMAC-SHA256(master, "oxfs/content" || id)`, so the key can be
//! rederived from the identifier carried in the object's header.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use rand::RngCore;
use ring::hmac;
use zeroize::Zeroizing;

use crate::id::FileId;

/// Length of the master key and of derived content keys.
pub const KEY_LEN: usize = 32;

const CONTENT_KEY_LABEL: &[u8] = b"oxfs/content";
const KEY_CHECK_LABEL: &[u8] = b"oxfs/key-check";

/// The repository master key.
///
/// The key bytes are wiped on drop. `Debug` is redacted.
#[derive(Clone)]
pub struct MasterKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey").field("bytes", &"[REDACTED]").finish()
    }
}

impl MasterKey {
    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill_bytes(&mut bytes[..]);
        Self { bytes }
    }

    pub fn from_bytes(raw: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(raw),
        }
    }

    /// Parse a hex-encoded key, ignoring surrounding whitespace.
    pub fn from_hex(text: &str) -> io::Result<Self> {
        let decoded = Zeroizing::new(
            hex::decode(text.trim())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        );
        let raw: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {KEY_LEN} key bytes, got {}", decoded.len()),
            )
        })?;
        Ok(Self::from_bytes(raw))
    }

    /// Read a hex key file.
    pub fn read_key_file(path: &Path) -> io::Result<Self> {
        let text = Zeroizing::new(fs::read_to_string(path)?);
        Self::from_hex(&text)
    }

    /// Write this key as hex to `path`, refusing to overwrite an existing file.
    pub fn write_key_file(&self, path: &Path) -> io::Result<()> {
        use std::io::Write;
        #[cfg(unix)]
        use std::os::unix::fs::OpenOptionsExt;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(path)?;
        let encoded = Zeroizing::new(hex::encode(&self.bytes[..]));
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    }

    /// Derive the content key of one object.
    pub fn derive_content_key(&self, id: &FileId) -> Zeroizing<[u8; KEY_LEN]> {
        let mut message = Vec::with_capacity(CONTENT_KEY_LABEL.len() + id.as_bytes().len());
        message.extend_from_slice(CONTENT_KEY_LABEL);
        message.extend_from_slice(id.as_bytes());
        self.mac(&message)
    }

    /// A value persisted in the repository config to detect a wrong key early.
    pub fn key_check(&self) -> [u8; KEY_LEN] {
        *self.mac(KEY_CHECK_LABEL)
    }

    fn mac(&self, message: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.bytes[..]);
        let tag = hmac::sign(&key, message);
        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        out.copy_from_slice(tag.as_ref());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_keys_differ_per_object() {
        let key = MasterKey::generate();
        let a = key.derive_content_key(&FileId::random());
        let b = key.derive_content_key(&FileId::random());
        assert_ne!(*a, *b);
    }

    #[test]
    fn derivation_is_deterministic() {
        let key = MasterKey::from_bytes([7u8; KEY_LEN]);
        let id = FileId::random();
        assert_eq!(*key.derive_content_key(&id), *key.derive_content_key(&id));
        assert_eq!(key.key_check(), key.key_check());
    }

    #[test]
    fn hex_round_trip_through_key_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        let key = MasterKey::generate();
        key.write_key_file(&path).unwrap();

        let loaded = MasterKey::read_key_file(&path).unwrap();
        assert_eq!(loaded.key_check(), key.key_check());

        // Refuses to clobber an existing key file.
        assert!(key.write_key_file(&path).is_err());
    }

    #[test]
    fn from_hex_rejects_short_keys() {
        let err = MasterKey::from_hex("abcd").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn debug_is_redacted() {
        let rendered = format!("{:?}", MasterKey::from_bytes([0x41; KEY_LEN]));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("41"));
    }
}
