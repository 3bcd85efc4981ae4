//! Stable identifiers for encrypted objects.

use std::fmt;
use std::path::PathBuf;

use rand::RngCore;

/// Length of a [`FileId`] in bytes.
pub const ID_LEN: usize = 32;

/// Opaque, path-independent name of an encrypted object.
///
/// Assigned once at creation and stored in the object's content header.
/// Two paths only resolve to the same id through hard links.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId([u8; ID_LEN]);

impl FileId {
    /// The root directory's identifier (all zeros).
    pub const fn root() -> Self {
        Self([0u8; ID_LEN])
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        loop {
            rand::rng().fill_bytes(&mut bytes);
            // The zero id is reserved for the root directory.
            if bytes != [0u8; ID_LEN] {
                return Self(bytes);
            }
        }
    }

    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an id from a byte slice; `None` unless exactly [`ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }

    /// Relative path of the content stream under the repository root.
    ///
    /// Objects fan out over 256 subdirectories keyed by the first byte.
    pub fn raw_name(&self) -> PathBuf {
        let hex = hex::encode(self.0);
        let (dir, rest) = hex.split_at(2);
        PathBuf::from(dir).join(rest)
    }

    /// Relative path of the metadata stream under the repository root.
    pub fn raw_meta_name(&self) -> PathBuf {
        let mut name = self.raw_name().into_os_string();
        name.push(".meta");
        PathBuf::from(name)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "FileId({}..)", &hex::encode(&self.0[..6]))
    }
}
