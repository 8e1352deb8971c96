//! Conflict resolution: last-write-wins per record
//!
//! The wall-clock `updated_at` decides which version of a record wins.
//! [`Stamp`] orders versions by `(updated_at, id)`; the id only matters when
//! stamps from different records are compared. There is no field-level merge.
//!
//! Wall clocks skew across devices; a device whose clock runs ahead wins
//! concurrent edits. This is a known limitation of the policy.

use std::cmp::Ordering;

/// The ordering key of one record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp<'a> {
    pub updated_at: i64,
    pub id: &'a str,
}

impl<'a> Stamp<'a> {
    pub const fn new(updated_at: i64, id: &'a str) -> Self {
        Self { updated_at, id }
    }

    /// Whether this version replaces `other` under last-write-wins
    pub fn supersedes(&self, other: &Self) -> bool {
        self > other
    }
}

/// Local side of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalState {
    pub updated_at: i64,
    pub dirty: bool,
}

/// What to do with an incoming remote version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local record and clear its dirty flag
    ApplyRemote,
    /// Discard the remote version; a dirty local record stays queued
    KeepLocal,
    /// Same version as the clean local record
    AlreadyCurrent,
}

/// Decide whether an incoming remote version supersedes the local record.
///
/// Both sides always carry the same record id, so the id part of [`Stamp`]
/// never decides anything here: only `updated_at` is compared, and a dirty
/// local record wins an exact tie. The replica's write guard in
/// `MemoryReplica::put_batch` uses [`Stamp`] and lets the later push win a tie.
pub fn resolve(local: Option<LocalState>, incoming_updated_at: i64) -> Resolution {
    let Some(local) = local else {
        return Resolution::ApplyRemote;
    };

    match incoming_updated_at.cmp(&local.updated_at) {
        Ordering::Greater => Resolution::ApplyRemote,
        Ordering::Less => Resolution::KeepLocal,
        Ordering::Equal if local.dirty => Resolution::KeepLocal,
        Ordering::Equal => Resolution::AlreadyCurrent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_local_applies_remote() {
        assert_eq!(resolve(None, 5), Resolution::ApplyRemote);
    }

    #[test]
    fn strictly_newer_remote_overwrites_even_dirty_local() {
        let local = LocalState {
            updated_at: 10,
            dirty: true,
        };
        assert_eq!(resolve(Some(local), 11), Resolution::ApplyRemote);
    }

    #[test]
    fn dirty_local_wins_ties_and_newer() {
        let local = LocalState {
            updated_at: 10,
            dirty: true,
        };
        assert_eq!(resolve(Some(local), 10), Resolution::KeepLocal);
        assert_eq!(resolve(Some(local), 9), Resolution::KeepLocal);
    }

    #[test]
    fn clean_local_with_same_stamp_is_current() {
        let local = LocalState {
            updated_at: 10,
            dirty: false,
        };
        assert_eq!(resolve(Some(local), 10), Resolution::AlreadyCurrent);
        assert_eq!(resolve(Some(local), 3), Resolution::KeepLocal);
    }

    #[test]
    fn tie_break_by_id_is_deterministic() {
        let a = Stamp::new(1_700_000_000_000, "018f0000-0000-7000-8000-00000000000a");
        let b = Stamp::new(1_700_000_000_000, "018f0000-0000-7000-8000-00000000000b");
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn timestamp_dominates_id() {
        let older = Stamp::new(1, "zzz");
        let newer = Stamp::new(2, "aaa");
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }
}
