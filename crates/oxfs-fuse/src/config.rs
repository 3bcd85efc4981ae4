//! Mount configuration.
//!
//! Everything here is supplied by the caller (the CLI); nothing is read from
//! the repository.

use std::time::Duration;

use crate::attr::OwnerOverride;

/// Default time-to-live for attributes and entries handed to the kernel.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Options consumed by the path-based operations and the FUSE adapter.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Reject every mutation with `EROFS` and take no repository lock.
    pub read_only: bool,

    /// Match names case-insensitively (NFC + lowercase fold).
    pub case_insensitive: bool,

    /// Substitute reported ownership.
    pub owner_override: OwnerOverride,

    /// Time-to-live for cached attributes and entries.
    pub attr_ttl: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            case_insensitive: false,
            owner_override: OwnerOverride::default(),
            attr_ttl: DEFAULT_TTL,
        }
    }
}

impl MountConfig {
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    #[must_use]
    pub fn owner_override(mut self, owner_override: OwnerOverride) -> Self {
        self.owner_override = owner_override;
        self
    }

    /// Sets the cache TTL for file attributes.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }
}
