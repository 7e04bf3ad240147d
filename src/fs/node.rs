//! Generic contract for nodes in the depot tree.
//!
//! This is a slightly cleaner interface than implementing fuser directly;
//! the adapter in [`super::fuser`] owns all fuser-specific detail, and the
//! node types only ever see these operations.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
use thiserror::Error;

use crate::p4::P4Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        // Access modes (mutually exclusive)
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;

        // Creation/status flags
        const APPEND = libc::O_APPEND;
        const TRUNC = libc::O_TRUNC;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;

        // Behavior flags
        const NONBLOCK = libc::O_NONBLOCK;
        const NOFOLLOW = libc::O_NOFOLLOW;
        const CLOEXEC = libc::O_CLOEXEC;
        const DIRECTORY = libc::O_DIRECTORY;

        /// Any flag that implies an intent to modify the file.
        const WRITE_INTENT = Self::WRONLY.bits()
            | Self::RDWR.bits()
            | Self::APPEND.bits()
            | Self::TRUNC.bits()
            | Self::CREAT.bits();
    }
}

impl OpenFlags {
    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRITE_INTENT)
    }
}

impl From<i32> for OpenFlags {
    fn from(val: i32) -> Self {
        Self::from_bits_truncate(val)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
}

/// Attributes of a node. Size and mtime only exist for regular files;
/// everything else reports zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAttr {
    RegularFile {
        perm: u16,
        size: u64,
        mtime: SystemTime,
    },
    Directory {
        perm: u16,
    },
    Symlink {
        perm: u16,
    },
}

impl NodeAttr {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::RegularFile { .. } => EntryKind::RegularFile,
            Self::Directory { .. } => EntryKind::Directory,
            Self::Symlink { .. } => EntryKind::Symlink,
        }
    }
}

/// One entry in a directory listing. `.` and `..` are the kernel's
/// business, not ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("entry does not exist")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("depot request failed: {0}")]
    Depot(#[from] P4Error),
}

impl From<LookupError> for i32 {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::NotFound => libc::ENOENT,
            LookupError::NotADirectory => libc::ENOTDIR,
            LookupError::Depot(_) => libc::EIO,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadDirError {
    #[error("not a directory")]
    NotADirectory,

    #[error("depot request failed: {0}")]
    Depot(#[from] P4Error),
}

impl From<ReadDirError> for i32 {
    fn from(e: ReadDirError) -> Self {
        match e {
            ReadDirError::NotADirectory => libc::ENOTDIR,
            ReadDirError::Depot(_) => libc::EIO,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadLinkError {
    #[error("not a symbolic link")]
    NotALink,

    #[error("no submitted changes reported")]
    NoChanges,

    #[error("link payload is not newline-terminated")]
    UnterminatedPayload,

    #[error("depot request failed: {0}")]
    Depot(#[from] P4Error),
}

impl From<ReadLinkError> for i32 {
    fn from(e: ReadLinkError) -> Self {
        match e {
            ReadLinkError::NotALink => libc::EINVAL,
            ReadLinkError::NoChanges
            | ReadLinkError::UnterminatedPayload
            | ReadLinkError::Depot(_) => libc::EIO,
        }
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("filesystem is read-only")]
    ReadOnly,

    #[error("is a directory")]
    IsADirectory,

    #[error("depot request failed: {0}")]
    Depot(#[from] P4Error),

    #[error("backing store I/O failed: {0}")]
    Backing(#[from] std::io::Error),
}

impl From<OpenError> for i32 {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::ReadOnly => libc::EROFS,
            OpenError::IsADirectory => libc::EISDIR,
            OpenError::Depot(_) | OpenError::Backing(_) => libc::EIO,
        }
    }
}

/// A node in the projected tree. Implementations are shared freely between
/// in-flight requests; all lazy state lives behind each node's own lock.
#[async_trait]
pub trait Node: std::fmt::Debug + Send + Sync + 'static {
    /// Immediate attributes. Never blocks on the depot.
    fn getattr(&self) -> NodeAttr;

    /// Resolve a child by name.
    async fn lookup(&self, _name: &str) -> Result<Arc<dyn Node>, LookupError> {
        Err(LookupError::NotADirectory)
    }

    /// List children, unordered.
    async fn readdir(&self) -> Result<Vec<DirEntry>, ReadDirError> {
        Err(ReadDirError::NotADirectory)
    }

    /// Target bytes of a symbolic link.
    async fn readlink(&self) -> Result<Vec<u8>, ReadLinkError> {
        Err(ReadLinkError::NotALink)
    }

    /// Open for reading, returning a descriptor on the materialized local
    /// copy. Any write intent fails before touching the depot.
    async fn open(&self, _flags: OpenFlags) -> Result<std::fs::File, OpenError> {
        Err(OpenError::IsADirectory)
    }

    /// Extended attributes exposed by this node.
    fn xattrs(&self) -> Vec<(&'static str, Vec<u8>)> {
        Vec::new()
    }

    /// Nothing in this tree may be removed.
    fn deletable(&self) -> bool {
        false
    }
}
