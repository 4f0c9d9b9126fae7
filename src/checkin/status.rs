//! Status classification (§4.4.1): map one tracked path's checkout row plus its observed
//! on-disk state to a single classification used by status, diff, and commit.
//!
//! Filesystem probing itself (mtime/size comparison, symlink detection) is an OS portability
//! concern out of scope for this crate (§1); `DiskState` is the injected result of that probe,
//! so `classify` stays a pure, deterministically testable function.

use crate::hash::ArtifactHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Deleted,
    Missing,
    NotAFile,
    Added,
    Edited,
    UpdatedByMerge,
    AddedByMerge,
    UpdatedByIntegrate,
    AddedByIntegrate,
    Executable,
    Symlink,
    UnExec,
    UnLink,
    Conflict,
    Renamed,
    Unchanged,
}

/// Checkout-local record of one tracked path (§3.3 `vfile`).
#[derive(Debug, Clone)]
pub struct VfileEntry {
    pub id: i64,
    pub pathname: String,
    pub origname: Option<String>,
    pub rid: i64,
    pub mrid: i64,
    pub mhash: Option<ArtifactHash>,
    /// 0 unchanged, 1 edited, 2 updated-by-merge, 3 added-by-merge, 4 updated-by-integrate,
    /// 5 added-by-integrate, 6-9 metadata-only variants (§3.3).
    pub chnged: i32,
    pub deleted: bool,
    pub isexe: bool,
    pub islink: bool,
}

impl VfileEntry {
    pub fn is_renamed(&self) -> bool {
        matches!(&self.origname, Some(orig) if orig != &self.pathname)
    }
}

/// Caller-probed on-disk state for one path, decoupled from any particular filesystem API.
#[derive(Debug, Clone, Copy)]
pub struct DiskState {
    pub exists: bool,
    pub is_regular: bool,
    pub is_symlink: bool,
    pub is_executable: bool,
    /// Whether content differs from the committed version, per the caller's mtime+size or
    /// full-rehash policy (§4.4.1: "change detection uses mtime+size by default; a
    /// caller-visible flag re-hashes every tracked file").
    pub changed: bool,
    pub has_conflict_marker: bool,
}

/// Classify one tracked path. Deterministic: identical inputs always produce the same
/// output, so re-running on an unchanged tree reproduces identical status for every path.
pub fn classify(entry: &VfileEntry, disk: &DiskState) -> FileStatus {
    if entry.deleted {
        return FileStatus::Deleted;
    }
    if !disk.exists {
        return FileStatus::Missing;
    }
    if !disk.is_regular && !disk.is_symlink {
        return FileStatus::NotAFile;
    }
    if entry.is_renamed() {
        return if disk.has_conflict_marker {
            FileStatus::Conflict
        } else {
            FileStatus::Renamed
        };
    }

    match entry.chnged {
        2 => return FileStatus::UpdatedByMerge,
        3 => return FileStatus::AddedByMerge,
        4 => return FileStatus::UpdatedByIntegrate,
        5 => return FileStatus::AddedByIntegrate,
        _ => {}
    }

    if disk.is_executable != entry.isexe {
        return if disk.is_executable {
            FileStatus::Executable
        } else {
            FileStatus::UnExec
        };
    }
    if disk.is_symlink != entry.islink {
        return if disk.is_symlink {
            FileStatus::Symlink
        } else {
            FileStatus::UnLink
        };
    }

    if entry.rid == 0 {
        return FileStatus::Added;
    }

    if disk.changed {
        return if disk.has_conflict_marker {
            FileStatus::Conflict
        } else {
            FileStatus::Edited
        };
    }

    FileStatus::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_entry() -> VfileEntry {
        VfileEntry {
            id: 1,
            pathname: "a.txt".into(),
            origname: None,
            rid: 7,
            mrid: 7,
            mhash: None,
            chnged: 0,
            deleted: false,
            isexe: false,
            islink: false,
        }
    }

    fn base_disk() -> DiskState {
        DiskState {
            exists: true,
            is_regular: true,
            is_symlink: false,
            is_executable: false,
            changed: false,
            has_conflict_marker: false,
        }
    }

    #[test]
    fn unchanged_file_classifies_unchanged() {
        assert_eq!(classify(&base_entry(), &base_disk()), FileStatus::Unchanged);
    }

    #[test]
    fn deleted_entry_wins_over_everything() {
        let mut entry = base_entry();
        entry.deleted = true;
        let mut disk = base_disk();
        disk.changed = true;
        assert_eq!(classify(&entry, &disk), FileStatus::Deleted);
    }

    #[test]
    fn missing_file_detected() {
        let entry = base_entry();
        let mut disk = base_disk();
        disk.exists = false;
        assert_eq!(classify(&entry, &disk), FileStatus::Missing);
    }

    #[test]
    fn edited_file_with_conflict_marker_is_conflict() {
        let entry = base_entry();
        let mut disk = base_disk();
        disk.changed = true;
        disk.has_conflict_marker = true;
        assert_eq!(classify(&entry, &disk), FileStatus::Conflict);
    }

    #[test]
    fn rename_without_content_change_is_renamed() {
        let mut entry = base_entry();
        entry.origname = Some("old.txt".into());
        let disk = base_disk();
        assert_eq!(classify(&entry, &disk), FileStatus::Renamed);
    }

    #[test]
    fn classification_is_deterministic_on_repeat() {
        let entry = base_entry();
        let disk = base_disk();
        assert_eq!(classify(&entry, &disk), classify(&entry, &disk));
    }
}
