//! Queue items: what a worker does and how conflicts are resolved.

use std::path::PathBuf;

/// Identity of a queue item, unique within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItemId(pub u64);

/// Transfer representation on the wire (`TYPE I` / `TYPE A`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransferMode {
    /// Image mode, bytes pass through untouched.
    #[default]
    Binary,
    /// ASCII mode, the server converts line terminators.
    Ascii,
}

impl TransferMode {
    /// The `TYPE` argument for this mode.
    #[must_use]
    pub fn type_arg(self) -> char {
        match self {
            TransferMode::Binary => 'I',
            TransferMode::Ascii => 'A',
        }
    }
}

/// How a conflicting target is handled on the next attempt. Set by the
/// resolver collaborator through
/// [`WorkQueue::update_forced_action`](crate::WorkQueue::update_forced_action)
/// after the worker reported the conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ForcedAction {
    /// Surface the conflict and wait for a decision.
    #[default]
    Ask,
    /// Continue a partial transfer from its current end.
    Resume,
    /// Replace the target from the beginning.
    Overwrite,
    /// Leave the target alone and finish the item as skipped.
    Skip,
    /// Keep the existing directory and treat the creation as done.
    UseExisting,
}

/// What a worker does for one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ItemKind {
    /// `DELE` — remove a remote file.
    DeleteFile {
        /// Remote path.
        path: String,
    },
    /// `RMD` — remove a remote directory, assumed empty.
    DeleteDir {
        /// Remote path.
        path: String,
    },
    /// `RETR` into a local file, resuming with `REST` when a partial
    /// target exists and resume is in force.
    Download {
        /// Remote source path.
        remote: String,
        /// Local target path.
        local: PathBuf,
        /// Wire representation.
        mode: TransferMode,
    },
    /// `STOR` (or `APPE` when resuming) from a local file, probing the
    /// target with `SIZE` first.
    Upload {
        /// Local source path.
        local: PathBuf,
        /// Remote target path.
        remote: String,
        /// Wire representation.
        mode: TransferMode,
    },
    /// `MKD` — create a remote directory.
    MakeDir {
        /// Remote path.
        path: String,
    },
    /// `CWD` + `PWD` + `TYPE A` + `LIST` into the shared list sink.
    ExploreDir {
        /// Remote path.
        path: String,
    },
    /// `SITE CHMOD` — change remote permission bits.
    ChangeAttrs {
        /// Remote path.
        path: String,
        /// Octal permission bits.
        mode: u32,
    },
    /// `CWD` probe: a link target is a directory exactly when the server
    /// lets us change into it.
    ResolveLink {
        /// Remote path of the link target.
        path: String,
    },
}

/// One unit of work pulled from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkItem {
    /// Queue identity, for forced-action updates.
    pub id: ItemId,
    /// What to do.
    pub kind: ItemKind,
    /// Conflict handling currently in force.
    pub forced: ForcedAction,
}

impl WorkItem {
    /// Creates an item with no forced action.
    #[must_use]
    pub fn new(id: ItemId, kind: ItemKind) -> Self {
        Self {
            id,
            kind,
            forced: ForcedAction::Ask,
        }
    }

    /// One-line description for status displays and the session log.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.kind {
            ItemKind::DeleteFile { path } => format!("delete file {path}"),
            ItemKind::DeleteDir { path } => format!("delete directory {path}"),
            ItemKind::Download { remote, local, .. } => {
                format!("download {remote} to {}", local.display())
            }
            ItemKind::Upload { local, remote, .. } => {
                format!("upload {} to {remote}", local.display())
            }
            ItemKind::MakeDir { path } => format!("create directory {path}"),
            ItemKind::ExploreDir { path } => format!("list directory {path}"),
            ItemKind::ChangeAttrs { path, mode } => format!("change mode of {path} to {mode:o}"),
            ItemKind::ResolveLink { path } => format!("resolve link {path}"),
        }
    }
}

/// Server-side effects that may or may not have happened when an item was
/// abandoned with a command in flight. The queue uses these to invalidate
/// listing caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InDoubtFlags {
    /// A `DELE`/`RMD` went out and its reply was never seen.
    pub deleted: bool,
    /// A `MKD` went out and its reply was never seen.
    pub created_dir: bool,
    /// A `STOR`/`APPE` went out and its reply was never seen.
    pub stored: bool,
}

impl InDoubtFlags {
    /// Whether any server-side effect is unaccounted for.
    #[must_use]
    pub fn any(&self) -> bool {
        self.deleted || self.created_dir || self.stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_names_the_operation_and_paths() {
        let item = WorkItem::new(
            ItemId(1),
            ItemKind::Download {
                remote: "/pub/file.bin".to_owned(),
                local: PathBuf::from("/tmp/file.bin"),
                mode: TransferMode::Binary,
            },
        );
        assert_eq!(item.summary(), "download /pub/file.bin to /tmp/file.bin");
        let chmod = WorkItem::new(
            ItemId(2),
            ItemKind::ChangeAttrs {
                path: "f".to_owned(),
                mode: 0o644,
            },
        );
        assert_eq!(chmod.summary(), "change mode of f to 644");
    }

    #[test]
    fn in_doubt_any_reports_set_flags() {
        let mut flags = InDoubtFlags::default();
        assert!(!flags.any());
        flags.stored = true;
        assert!(flags.any());
    }
}
