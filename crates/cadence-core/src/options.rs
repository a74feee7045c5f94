//! The session's core-option table.
//!
//! A bounded table of key/value configuration entries for the wrapped
//! simulation. The authority replicates the whole table to joiners inside
//! the save-state transfer, and replicates individual mutations
//! frame-precisely through the option slot of its state ring.

use cadence_proto::CoreOption;
use zerocopy::{FromBytes, IntoBytes};

use crate::SessionError;

/// Capacity of the option table.
pub const MAX_CORE_OPTIONS: usize = 128;

/// Fixed-capacity option table, replicated byte-for-byte.
#[derive(Clone)]
pub struct CoreOptions {
    entries: Box<[CoreOption; MAX_CORE_OPTIONS]>,
}

impl CoreOptions {
    /// Serialized size of the whole table.
    pub const TABLE_BYTES: usize = MAX_CORE_OPTIONS * CoreOption::SIZE;

    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Box::new([CoreOption::default(); MAX_CORE_OPTIONS]) }
    }

    /// Fill the table from the application's option list, in order.
    /// Entries beyond capacity are ignored.
    pub fn populate(&mut self, options: &[CoreOption]) {
        self.entries.fill(CoreOption::default());
        for (slot, option) in self.entries.iter_mut().zip(options) {
            *slot = *option;
        }
    }

    /// Value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|entry| !entry.is_empty() && entry.key() == key)
            .map(|entry| entry.value().into_owned())
    }

    /// Apply a replicated mutation: update the entry whose key matches.
    /// Returns whether anything changed; unknown keys are dropped.
    pub fn apply(&mut self, option: &CoreOption) -> bool {
        for entry in self.entries.iter_mut() {
            if !entry.is_empty() && entry.key() == option.key() {
                *entry = *option;
                return true;
            }
        }
        false
    }

    /// The table as replication bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.entries.as_bytes()
    }

    /// Rebuild a table from replication bytes (exact size required).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        let entries = <[CoreOption; MAX_CORE_OPTIONS]>::read_from_bytes(bytes).map_err(|_| {
            SessionError::Protocol(cadence_proto::ProtocolError::Truncated {
                expected: Self::TABLE_BYTES,
                actual: bytes.len(),
            })
        })?;
        Ok(Self { entries: Box::new(entries) })
    }

    /// Iterate the occupied entries.
    pub fn iter(&self) -> impl Iterator<Item = &CoreOption> {
        self.entries.iter().filter(|entry| !entry.is_empty())
    }
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter().map(|e| (e.key().into_owned(), e.value().into_owned()))).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_updates_known_keys_only() {
        let mut options = CoreOptions::new();
        options.populate(&[
            CoreOption::new("video_scale", "2"),
            CoreOption::new("netplay_delay_frames", "1"),
        ]);

        assert!(options.apply(&CoreOption::new("netplay_delay_frames", "3")));
        assert_eq!(options.get("netplay_delay_frames").as_deref(), Some("3"));

        assert!(!options.apply(&CoreOption::new("unknown_key", "x")));
        assert_eq!(options.get("unknown_key"), None);
    }

    #[test]
    fn byte_round_trip() {
        let mut options = CoreOptions::new();
        options.populate(&[CoreOption::new("audio_sync", "on")]);

        let restored = CoreOptions::from_bytes(options.as_bytes()).unwrap();
        assert_eq!(restored.get("audio_sync").as_deref(), Some("on"));
        assert_eq!(options.as_bytes(), restored.as_bytes());
    }

    #[test]
    fn from_bytes_requires_exact_size() {
        assert!(CoreOptions::from_bytes(&[0u8; 100]).is_err());
    }
}
