//! Version-vector reconciliation.
//!
//! Pure decisions over (local row, remote row) pairs; the worker applies
//! them. A dominating side wins outright; concurrent edits conflict and
//! the deterministic tie-break decides which side renames its copy aside,
//! so the two devices never swap files.

use crate::store::{FileEntry, FileKind, FileStatus, SyncPerm};
use crate::vclock::VClockOrder;

/// What role the local tree plays in its sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairRole {
    /// Ordinary bidirectional member.
    Normal,
    /// Backup source: sends only, adopts nothing.
    BackupSrc,
    /// Backup destination: adopts everything from the source.
    BackupDst,
}

/// Gate derived from the sync's permission for the receiving side.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext {
    pub perm: SyncPerm,
    pub role: PairRole,
}

impl ReconcileContext {
    /// Whether this side may adopt remote versions at all.
    pub fn may_receive(&self) -> bool {
        if self.role == PairRole::BackupSrc {
            return false;
        }
        matches!(self.perm, SyncPerm::Rdonly | SyncPerm::Rdwr)
    }
}

/// One decision for a path.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// Create the remote directory locally.
    CreateDir { remote: FileEntry },
    /// Fetch the remote file's content and adopt its row.
    FetchFile { remote: FileEntry },
    /// Adopt the remote row without a transfer (content already matches).
    AdoptMeta { remote: FileEntry },
    /// Apply the remote tombstone: move the local file to trash.
    DeleteLocal { local: FileEntry, remote: FileEntry },
    /// Concurrent edits where the remote wins: rename the local copy to a
    /// conflict sibling, then fetch the remote version.
    ConflictFetch { local: FileEntry, remote: FileEntry },
}

impl ReconcileAction {
    /// The remote row this action adopts.
    pub fn remote(&self) -> &FileEntry {
        match self {
            ReconcileAction::CreateDir { remote }
            | ReconcileAction::FetchFile { remote }
            | ReconcileAction::AdoptMeta { remote }
            | ReconcileAction::DeleteLocal { remote, .. }
            | ReconcileAction::ConflictFetch { remote, .. } => remote,
        }
    }
}

/// Deterministic winner of a concurrent edit: later timestamp wins, the
/// modifier uuid breaks exact ties. Both devices evaluate the same data,
/// so exactly one side sees `true`.
fn remote_wins(local: &FileEntry, remote: &FileEntry) -> bool {
    (remote.time_stamp, remote.modifier.as_str()) > (local.time_stamp, local.modifier.as_str())
}

/// Decide what to do about one path.
///
/// `local` is our row (if any); `remote` is the mirrored remote row.
pub fn reconcile_path(
    local: Option<&FileEntry>,
    remote: &FileEntry,
    ctx: &ReconcileContext,
) -> Option<ReconcileAction> {
    if !ctx.may_receive() {
        return None;
    }

    let adopt = |remote: &FileEntry| -> Option<ReconcileAction> {
        if remote.status == FileStatus::Remove {
            // Tombstone with nothing local to delete.
            return None;
        }
        Some(match remote.kind {
            FileKind::Directory => ReconcileAction::CreateDir {
                remote: remote.clone(),
            },
            FileKind::Regular => ReconcileAction::FetchFile {
                remote: remote.clone(),
            },
        })
    };

    let Some(local) = local else {
        return adopt(remote);
    };

    match local.vclock.compare(&remote.vclock) {
        VClockOrder::Equal | VClockOrder::Dominates => None,
        VClockOrder::Dominated => {
            if remote.status == FileStatus::Remove {
                if local.status == FileStatus::Remove {
                    None
                } else {
                    Some(ReconcileAction::DeleteLocal {
                        local: local.clone(),
                        remote: remote.clone(),
                    })
                }
            } else if local.status == FileStatus::Remove {
                adopt(remote)
            } else if local.kind == remote.kind && local.sha1 == remote.sha1 {
                // Same content on both sides; only the clocks lag.
                Some(ReconcileAction::AdoptMeta {
                    remote: remote.clone(),
                })
            } else {
                adopt(remote)
            }
        }
        VClockOrder::Concurrent => {
            if remote.status == FileStatus::Remove {
                // Delete/edit race: the edit survives. Never data-losing.
                return None;
            }
            if local.status == FileStatus::Remove {
                // Edit/delete race seen from the deleting side.
                return adopt(remote);
            }
            if local.sha1 == remote.sha1 && local.kind == remote.kind {
                // Identical concurrent result; converge the clocks.
                return Some(ReconcileAction::AdoptMeta {
                    remote: remote.clone(),
                });
            }
            if remote_wins(local, remote) {
                Some(ReconcileAction::ConflictFetch {
                    local: local.clone(),
                    remote: remote.clone(),
                })
            } else {
                None
            }
        }
    }
}

/// Name of the conflict sibling a losing copy is renamed to.
pub fn conflict_name(path: &str, loser_device: &str, time_stamp: i64) -> String {
    format!("{path}.conflict.{loser_device}.{time_stamp}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vclock::VClock;

    fn entry(path: &str, local: i64, remote: i64, sha1: &str, ts: i64) -> FileEntry {
        FileEntry {
            id: 0,
            path: path.to_string(),
            kind: FileKind::Regular,
            status: FileStatus::Normal,
            mtime: ts,
            length: 5,
            usn: 1,
            sha1: sha1.to_string(),
            modifier: "dev".to_string(),
            win_attr: 0,
            unix_attr: 0,
            vclock: VClock::new(local, remote),
            alias: String::new(),
            time_stamp: ts,
        }
    }

    fn ctx() -> ReconcileContext {
        ReconcileContext {
            perm: SyncPerm::Rdwr,
            role: PairRole::Normal,
        }
    }

    #[test]
    fn new_remote_file_is_fetched() {
        let remote = entry("/x.txt", 1, 0, "h1", 10);
        let action = reconcile_path(None, &remote, &ctx()).unwrap();
        assert!(matches!(action, ReconcileAction::FetchFile { .. }));
    }

    #[test]
    fn remote_tombstone_without_local_row_is_ignored() {
        let mut remote = entry("/x.txt", 2, 0, "", 10);
        remote.status = FileStatus::Remove;
        assert_eq!(reconcile_path(None, &remote, &ctx()), None);
    }

    #[test]
    fn dominating_remote_edit_is_adopted() {
        // We created (1,0), they adopted and edited: their row (2,1).
        let local = entry("/x.txt", 1, 0, "h1", 10);
        let remote = entry("/x.txt", 2, 1, "h2", 20);
        let action = reconcile_path(Some(&local), &remote, &ctx()).unwrap();
        assert!(matches!(action, ReconcileAction::FetchFile { .. }));
    }

    #[test]
    fn our_dominating_edit_stays() {
        // We edited twice (2,1); they still hold the first version (1,1).
        let local = entry("/x.txt", 2, 1, "h2", 20);
        let remote = entry("/x.txt", 1, 1, "h1", 10);
        assert_eq!(reconcile_path(Some(&local), &remote, &ctx()), None);
    }

    #[test]
    fn dominating_tombstone_deletes() {
        let local = entry("/x.txt", 1, 0, "h1", 10);
        let mut remote = entry("/x.txt", 2, 1, "", 20);
        remote.status = FileStatus::Remove;
        let action = reconcile_path(Some(&local), &remote, &ctx()).unwrap();
        assert!(matches!(action, ReconcileAction::DeleteLocal { .. }));
    }

    #[test]
    fn concurrent_edits_conflict_exactly_one_way() {
        // Both sides edited after exchanging version 1.
        let ours = entry("/x.txt", 2, 1, "h3", 30);
        let theirs_mirrored = entry("/x.txt", 2, 1, "h4", 40);
        // Their edit is newer: we lose and fetch.
        let action = reconcile_path(Some(&ours), &theirs_mirrored, &ctx()).unwrap();
        assert!(matches!(action, ReconcileAction::ConflictFetch { .. }));

        // Seen from the other device the roles swap and nothing happens.
        let action = reconcile_path(Some(&theirs_mirrored), &ours, &ctx());
        assert_eq!(action, None);
    }

    #[test]
    fn concurrent_delete_loses_to_edit() {
        let ours = entry("/x.txt", 2, 1, "h3", 30);
        let mut theirs = entry("/x.txt", 2, 1, "", 40);
        theirs.status = FileStatus::Remove;
        assert_eq!(reconcile_path(Some(&ours), &theirs, &ctx()), None);
    }

    #[test]
    fn backup_src_adopts_nothing() {
        let remote = entry("/x.txt", 1, 0, "h1", 10);
        let ctx = ReconcileContext {
            perm: SyncPerm::Rdwr,
            role: PairRole::BackupSrc,
        };
        assert_eq!(reconcile_path(None, &remote, &ctx), None);
    }

    #[test]
    fn wronly_side_never_receives() {
        let remote = entry("/x.txt", 1, 0, "h1", 10);
        let ctx = ReconcileContext {
            perm: SyncPerm::Wronly,
            role: PairRole::Normal,
        };
        assert_eq!(reconcile_path(None, &remote, &ctx), None);
    }

    #[test]
    fn conflict_names_are_stable() {
        assert_eq!(
            conflict_name("/a/x.txt", "dev-b", 99),
            "/a/x.txt.conflict.dev-b.99"
        );
    }
}
