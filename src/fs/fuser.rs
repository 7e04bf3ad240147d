//! Bridge between [`fuser`] and the [`Node`] layer.
//!
//! The adapter owns the inode, child-name, and file-handle tables and fans
//! each kernel request out onto the tokio runtime as an instrumented task.
//! Nodes never see fuser types, and every mutating operation is rejected
//! here with `EROFS` before it can reach a node.

use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FUSE_ROOT_ID, TimeOrNow};
use tracing::Instrument as _;
use tracing::debug;

use crate::fs::node::{EntryKind, Node, NodeAttr, OpenFlags};

/// How long the kernel may cache entries and attributes. Listings never
/// change within a mount, so this is purely a chattiness knob.
const TTL: Duration = Duration::from_secs(1);

const BLOCK_SIZE: u32 = 4096;

impl From<EntryKind> for fuser::FileType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::RegularFile => Self::RegularFile,
            EntryKind::Directory => Self::Directory,
            EntryKind::Symlink => Self::Symlink,
        }
    }
}

fn attr_for(ino: u64, attr: NodeAttr, owner: (u32, u32)) -> fuser::FileAttr {
    let (kind, perm, size, mtime, nlink) = match attr {
        NodeAttr::RegularFile { perm, size, mtime } => {
            (fuser::FileType::RegularFile, perm, size, mtime, 1)
        }
        NodeAttr::Directory { perm } => (fuser::FileType::Directory, perm, 0, UNIX_EPOCH, 2),
        NodeAttr::Symlink { perm } => (fuser::FileType::Symlink, perm, 0, UNIX_EPOCH, 1),
    };
    fuser::FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink,
        uid: owner.0,
        gid: owner.1,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Read up to `size` bytes at `offset`, retrying interrupted reads.
fn read_at_full(file: &std::fs::File, offset: u64, size: u32) -> std::io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt as _;

    let mut buf = vec![0u8; size as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Shared lookup state. Inode numbers are handed out on first sight of a
/// (parent, name) pair and stay stable; nodes are retained for the life of
/// the mount.
struct Tables {
    nodes: scc::HashMap<u64, Arc<dyn Node>>,
    children: scc::HashMap<(u64, String), u64>,
    handles: scc::HashMap<u64, std::fs::File>,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    owner: (u32, u32),
}

impl Tables {
    fn node(&self, ino: u64) -> Option<Arc<dyn Node>> {
        self.nodes.read(&ino, |_, n| Arc::clone(n))
    }

    /// Stable inode for a (parent, name) pair, allocated on first use.
    fn child_ino(&self, parent: u64, name: &str) -> u64 {
        let key = (parent, name.to_owned());
        if let Some(ino) = self.children.read(&key, |_, v| *v) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        match self.children.insert(key, ino) {
            Ok(()) => ino,
            // Lost the race; the winner's number is authoritative. Entries
            // are never removed, so the read after a failed insert hits.
            Err((key, _)) => self.children.read(&key, |_, v| *v).unwrap_or(ino),
        }
    }

    /// Bind `node` under its stable inode. The first binding wins so that
    /// lazily fetched node state survives repeat lookups.
    fn bind_child(&self, parent: u64, name: &str, node: Arc<dyn Node>) -> (u64, Arc<dyn Node>) {
        let ino = self.child_ino(parent, name);
        match self.nodes.insert(ino, Arc::clone(&node)) {
            Ok(()) => (ino, node),
            Err(_) => (ino, self.node(ino).unwrap_or(node)),
        }
    }
}

pub struct FuserAdapter {
    tables: Arc<Tables>,
    runtime: tokio::runtime::Handle,
}

impl FuserAdapter {
    pub fn new(root: Arc<dyn Node>, owner: (u32, u32), runtime: tokio::runtime::Handle) -> Self {
        let tables = Tables {
            nodes: scc::HashMap::new(),
            children: scc::HashMap::new(),
            handles: scc::HashMap::new(),
            next_ino: AtomicU64::new(FUSE_ROOT_ID + 1),
            next_fh: AtomicU64::new(1),
            owner,
        };
        drop(tables.nodes.insert(FUSE_ROOT_ID, root));
        Self {
            tables: Arc::new(tables),
            runtime,
        }
    }

    fn spawn<Fut>(&self, span: tracing::Span, f: impl FnOnce(Arc<Tables>) -> Fut + Send + 'static)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tables = Arc::clone(&self.tables);
        self.runtime.spawn(f(tables).instrument(span));
    }
}

impl fuser::Filesystem for FuserAdapter {
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = name.to_str().map(str::to_owned) else {
            // Depot names are UTF-8; anything else cannot exist here.
            reply.error(libc::ENOENT);
            return;
        };
        let span = tracing::debug_span!("lookup", parent, %name);
        self.spawn(span, move |tables| async move {
            let Some(parent_node) = tables.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };

            // Fast path: a child bound by an earlier lookup.
            if let Some(ino) = tables.children.read(&(parent, name.clone()), |_, v| *v) {
                if let Some(node) = tables.node(ino) {
                    reply.entry(&TTL, &attr_for(ino, node.getattr(), tables.owner), 0);
                    return;
                }
            }

            match parent_node.lookup(&name).await {
                Ok(node) => {
                    let (ino, node) = tables.bind_child(parent, &name, node);
                    debug!(ino, "resolved");
                    reply.entry(&TTL, &attr_for(ino, node.getattr(), tables.owner), 0);
                }
                Err(e) => {
                    debug!(error = %e, "lookup failed");
                    reply.error(e.into());
                }
            }
        });
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let span = tracing::debug_span!("getattr", ino);
        self.spawn(span, move |tables| async move {
            match tables.node(ino) {
                Some(node) => reply.attr(&TTL, &attr_for(ino, node.getattr(), tables.owner)),
                None => reply.error(libc::ENOENT),
            }
        });
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let span = tracing::debug_span!("readlink", ino);
        self.spawn(span, move |tables| async move {
            let Some(node) = tables.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match node.readlink().await {
                Ok(target) => reply.data(&target),
                Err(e) => {
                    debug!(error = %e, "readlink failed");
                    reply.error(e.into());
                }
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let span = tracing::debug_span!("readdir", ino, offset);
        self.spawn(span, move |tables| async move {
            let Some(node) = tables.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let entries = match node.readdir().await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(error = %e, "readdir failed");
                    reply.error(e.into());
                    return;
                }
            };

            for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
                let child_ino = tables.child_ino(ino, &entry.name);
                let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                    reply.error(libc::EIO);
                    return;
                };
                if reply.add(child_ino, next, entry.kind.into(), &entry.name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags: OpenFlags = flags.into();
        let span = tracing::debug_span!("open", ino, ?flags);
        self.spawn(span, move |tables| async move {
            let Some(node) = tables.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match node.open(flags).await {
                Ok(file) => {
                    let fh = tables.next_fh.fetch_add(1, Ordering::Relaxed);
                    drop(tables.handles.insert(fh, file));
                    debug!(fh, "opened");
                    reply.opened(fh, 0);
                }
                Err(e) => {
                    debug!(error = %e, "open failed");
                    reply.error(e.into());
                }
            }
        });
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let span = tracing::debug_span!("read", fh, offset, size);
        self.spawn(span, move |tables| async move {
            let result = tables
                .handles
                .read(&fh, |_, file| read_at_full(file, offset.max(0) as u64, size));
            match result {
                None => reply.error(libc::EBADF),
                Some(Ok(buf)) => reply.data(&buf),
                Some(Err(e)) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        // Nothing buffered on our side.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("release", fh);
        self.spawn(span, move |tables| async move {
            if tables.handles.remove(&fh).is_some() {
                reply.ok();
            } else {
                reply.error(libc::EBADF);
            }
        });
    }

    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let Some(name) = name.to_str().map(str::to_owned) else {
            reply.error(libc::ENODATA);
            return;
        };
        let span = tracing::debug_span!("getxattr", ino, %name);
        self.spawn(span, move |tables| async move {
            let Some(node) = tables.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let Some((_, value)) = node.xattrs().into_iter().find(|(n, _)| *n == name) else {
                reply.error(libc::ENODATA);
                return;
            };
            match u32::try_from(value.len()) {
                Ok(len) if size == 0 => reply.size(len),
                Ok(len) if size >= len => reply.data(&value),
                _ => reply.error(libc::ERANGE),
            }
        });
    }

    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let span = tracing::debug_span!("listxattr", ino);
        self.spawn(span, move |tables| async move {
            let Some(node) = tables.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let mut names = Vec::new();
            for (name, _) in node.xattrs() {
                names.extend_from_slice(name.as_bytes());
                names.push(0);
            }
            match u32::try_from(names.len()) {
                Ok(len) if size == 0 => reply.size(len),
                Ok(len) if size >= len => reply.data(&names),
                _ => reply.error(libc::ERANGE),
            }
        });
    }

    // Everything below would mutate the tree; the whole mount is read-only.

    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        reply.error(libc::EROFS);
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn setxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn removexattr(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_for_regular_file() {
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let attr = attr_for(
            7,
            NodeAttr::RegularFile {
                perm: 0o644,
                size: 1536,
                mtime,
            },
            (1000, 1000),
        );
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.size, 1536);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.mtime, mtime);
        assert_eq!((attr.uid, attr.gid), (1000, 1000));
    }

    #[test]
    fn attr_for_directory_and_link_report_zero_size() {
        let dir = attr_for(2, NodeAttr::Directory { perm: 0o755 }, (0, 0));
        assert_eq!(dir.kind, fuser::FileType::Directory);
        assert_eq!(dir.size, 0);
        assert_eq!(dir.mtime, UNIX_EPOCH);

        let link = attr_for(3, NodeAttr::Symlink { perm: 0o777 }, (0, 0));
        assert_eq!(link.kind, fuser::FileType::Symlink);
        assert_eq!(link.size, 0);
    }

    #[test]
    fn child_inodes_are_stable() {
        let tables = Tables {
            nodes: scc::HashMap::new(),
            children: scc::HashMap::new(),
            handles: scc::HashMap::new(),
            next_ino: AtomicU64::new(2),
            next_fh: AtomicU64::new(1),
            owner: (0, 0),
        };
        let a = tables.child_ino(1, "700");
        let b = tables.child_ino(1, "701");
        assert_ne!(a, b);
        assert_eq!(tables.child_ino(1, "700"), a);
        // Same name under a different parent is a different entry.
        assert_ne!(tables.child_ino(a, "700"), a);
    }
}
