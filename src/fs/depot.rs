//! The depot node types.
//!
//! The root exposes one directory per submitted changelist (by number) plus
//! the `head` symlink. Folder contents are fetched from the depot once and
//! frozen; file contents are materialized into the backing store on first
//! open.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::BackingStore;
use crate::fs::node::{
    DirEntry, EntryKind, LookupError, Node, NodeAttr, OpenError, OpenFlags, ReadDirError,
    ReadLinkError,
};
use crate::p4::{Conn, P4Error, Record, Stat};

/// Name of the symlink at the root pointing at the latest changelist.
pub const HEAD_LINK_NAME: &str = "head";

/// Extended attribute carrying the depot's content digest for a revision.
pub const DIGEST_XATTR: &str = "user.p4.digest";

const DIR_PERM: u16 = 0o755;
const FILE_PERM: u16 = 0o644;
const EXEC_PERM: u16 = 0o755;
const LINK_PERM: u16 = 0o777;

/// Shared state every node in one mount hangs on to.
#[derive(Debug)]
pub struct P4Fs {
    p4: Conn,
    store: BackingStore,
}

impl P4Fs {
    pub fn new(p4: Conn, store: BackingStore) -> Arc<Self> {
        Arc::new(Self { p4, store })
    }

    /// The mount root.
    pub fn root(self: &Arc<Self>) -> Arc<dyn Node> {
        Arc::new(Root {
            fs: Arc::clone(self),
        })
    }

    fn new_folder(self: &Arc<Self>, path: String, change: i64) -> Arc<dyn Node> {
        Arc::new(Folder {
            fs: Arc::clone(self),
            path,
            change,
            listing: Mutex::new(None),
        })
    }

    fn new_file(self: &Arc<Self>, stat: Stat) -> Arc<dyn Node> {
        Arc::new(FileNode {
            fs: Arc::clone(self),
            stat,
            backing: Mutex::new(None),
        })
    }
}

/// Attributes for a file revision per its depot file type. Executable
/// types get the exec bits; anything unrecognized is a plain 0644 file.
fn file_attr(stat: &Stat) -> NodeAttr {
    match stat.head_type.as_str() {
        "symlink" => NodeAttr::Symlink { perm: LINK_PERM },
        "xtext" | "xbinary" | "kxtext" => NodeAttr::RegularFile {
            perm: EXEC_PERM,
            size: u64::try_from(stat.file_size).unwrap_or(0),
            mtime: UNIX_EPOCH + Duration::from_secs(u64::try_from(stat.head_time).unwrap_or(0)),
        },
        _ => NodeAttr::RegularFile {
            perm: FILE_PERM,
            size: u64::try_from(stat.file_size).unwrap_or(0),
            mtime: UNIX_EPOCH + Duration::from_secs(u64::try_from(stat.head_time).unwrap_or(0)),
        },
    }
}

/// Last `/`-separated segment of a depot path.
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_owned()
    } else {
        format!("{base}/{name}")
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Root {
    fs: Arc<P4Fs>,
}

#[async_trait]
impl Node for Root {
    fn getattr(&self) -> NodeAttr {
        NodeAttr::Directory { perm: DIR_PERM }
    }

    async fn lookup(&self, name: &str) -> Result<Arc<dyn Node>, LookupError> {
        if name == HEAD_LINK_NAME {
            return Ok(Arc::new(HeadLink {
                fs: Arc::clone(&self.fs),
            }));
        }
        // Any decimal integer names a changelist folder. Whether the
        // changelist exists is only discovered on its first fetch.
        let change: i64 = name.parse().map_err(|_| LookupError::NotFound)?;
        Ok(self.fs.new_folder(String::new(), change))
    }

    async fn readdir(&self) -> Result<Vec<DirEntry>, ReadDirError> {
        // The set of changelists is unbounded, so only the head link is
        // enumerated.
        Ok(vec![DirEntry {
            name: HEAD_LINK_NAME.to_owned(),
            kind: EntryKind::Symlink,
        }])
    }
}

// ---------------------------------------------------------------------------
// HeadLink
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HeadLink {
    fs: Arc<P4Fs>,
}

#[async_trait]
impl Node for HeadLink {
    fn getattr(&self) -> NodeAttr {
        NodeAttr::Symlink { perm: LINK_PERM }
    }

    async fn readlink(&self) -> Result<Vec<u8>, ReadLinkError> {
        let records = self.fs.p4.changes(&["-s", "submitted", "-m1"]).await?;
        let change = records
            .iter()
            .find_map(|r| match r {
                Record::Change(c) => Some(c.change),
                _ => None,
            })
            .ok_or(ReadLinkError::NoChanges)?;
        Ok(change.to_string().into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Folder
// ---------------------------------------------------------------------------

/// Contents of a folder at a fixed changelist, frozen at first fetch.
#[derive(Debug, Default)]
struct Listing {
    files: HashMap<String, Stat>,
    folders: HashSet<String>,
}

/// A directory inside one changelist. The changelist root is the special
/// case `path == ""`; deeper folders work identically.
#[derive(Debug)]
struct Folder {
    fs: Arc<P4Fs>,
    /// Depot-relative path, no leading or trailing slash.
    path: String,
    change: i64,
    /// `None` until the first successful fetch, immutable after.
    listing: Mutex<Option<Arc<Listing>>>,
}

impl Folder {
    /// The wildcard the depot is asked about: `//<path>/*@<change>`.
    fn listing_path(&self) -> String {
        let mut p = format!("//{}", self.path);
        if !p.ends_with('/') {
            p.push('/');
        }
        p.push_str(&format!("*@{}", self.change));
        p
    }

    /// One-shot population of the child maps. The lock is held across the
    /// client calls, so at most one fetch per folder is in flight; a
    /// failure leaves the slot empty and a later call retries.
    async fn fetch(&self) -> Result<Arc<Listing>, P4Error> {
        let mut slot = self.listing.lock().await;
        if let Some(listing) = &*slot {
            return Ok(Arc::clone(listing));
        }

        let path = self.listing_path();
        let dirs = self
            .fs
            .p4
            .dirs(&[path.as_str()])
            .await
            .inspect_err(|e| warn!(listing = %path, error = %e, "dirs failed"))?;
        let files = self
            .fs
            .p4
            .fstat(&[path.as_str()])
            .await
            .inspect_err(|e| warn!(listing = %path, error = %e, "fstat failed"))?;

        let mut listing = Listing::default();
        for record in files {
            match record {
                Record::Stat(stat) => {
                    if stat.head_action == "delete" {
                        continue;
                    }
                    listing
                        .files
                        .insert(basename(&stat.depot_file).to_owned(), stat);
                }
                Record::Error(e) => debug!(listing = %path, error = %e, "fstat error record"),
                _ => {}
            }
        }
        for record in dirs {
            match record {
                Record::Dir(dir) => {
                    listing.folders.insert(basename(&dir.dir).to_owned());
                }
                Record::Error(e) => debug!(listing = %path, error = %e, "dirs error record"),
                _ => {}
            }
        }

        debug!(
            listing = %path,
            files = listing.files.len(),
            folders = listing.folders.len(),
            "fetched folder"
        );
        let listing = Arc::new(listing);
        *slot = Some(Arc::clone(&listing));
        Ok(listing)
    }
}

#[async_trait]
impl Node for Folder {
    fn getattr(&self) -> NodeAttr {
        NodeAttr::Directory { perm: DIR_PERM }
    }

    async fn lookup(&self, name: &str) -> Result<Arc<dyn Node>, LookupError> {
        let listing = self.fetch().await?;
        if let Some(stat) = listing.files.get(name) {
            Ok(self.fs.new_file(stat.clone()))
        } else if listing.folders.contains(name) {
            Ok(self
                .fs
                .new_folder(join_path(&self.path, name), self.change))
        } else {
            Err(LookupError::NotFound)
        }
    }

    async fn readdir(&self) -> Result<Vec<DirEntry>, ReadDirError> {
        let listing = self.fetch().await?;
        let mut entries = Vec::with_capacity(listing.files.len() + listing.folders.len());
        for name in listing.files.keys() {
            entries.push(DirEntry {
                name: name.clone(),
                kind: EntryKind::RegularFile,
            });
        }
        for name in &listing.folders {
            entries.push(DirEntry {
                name: name.clone(),
                kind: EntryKind::Directory,
            });
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// FileNode
// ---------------------------------------------------------------------------

/// A single file revision. The stat is frozen at the parent's fetch; the
/// backing path is set once and never cleared.
#[derive(Debug)]
struct FileNode {
    fs: Arc<P4Fs>,
    stat: Stat,
    backing: Mutex<Option<PathBuf>>,
}

impl FileNode {
    /// Ensure the revision has a local copy and return its path.
    ///
    /// Serialized per node by the lock; cross-process races are settled by
    /// the store's atomic rename. A failure leaves the slot empty so the
    /// next open retries.
    async fn materialize(&self) -> Result<PathBuf, OpenError> {
        let mut backing = self.backing.lock().await;
        if let Some(path) = &*backing {
            return Ok(path.clone());
        }

        let identity = self.stat.identity();
        let path = if self.fs.store.contains(&identity) {
            self.fs.store.entry_path(&identity)
        } else {
            let content = self
                .fs
                .p4
                .print(&identity)
                .await
                .inspect_err(|e| warn!(%identity, error = %e, "print failed"))?;
            self.fs
                .store
                .insert(&identity, &content)
                .inspect_err(|e| warn!(%identity, error = %e, "backing store write failed"))?
        };

        *backing = Some(path.clone());
        Ok(path)
    }
}

#[async_trait]
impl Node for FileNode {
    fn getattr(&self) -> NodeAttr {
        file_attr(&self.stat)
    }

    async fn readlink(&self) -> Result<Vec<u8>, ReadLinkError> {
        if self.stat.head_type != "symlink" {
            return Err(ReadLinkError::NotALink);
        }
        let mut payload = self.fs.p4.print(&self.stat.identity()).await?;
        if payload.last() != Some(&b'\n') {
            return Err(ReadLinkError::UnterminatedPayload);
        }
        payload.pop();
        Ok(payload)
    }

    async fn open(&self, flags: OpenFlags) -> Result<std::fs::File, OpenError> {
        if flags.wants_write() {
            return Err(OpenError::ReadOnly);
        }
        let path = self.materialize().await?;
        Ok(std::fs::File::open(path)?)
    }

    fn xattrs(&self) -> Vec<(&'static str, Vec<u8>)> {
        if self.stat.digest.is_empty() {
            return Vec::new();
        }
        vec![(DIGEST_XATTR, self.stat.digest.clone().into_bytes())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p4::ConnOptions;

    fn test_fs() -> Arc<P4Fs> {
        P4Fs::new(
            Conn::new(ConnOptions::default()),
            BackingStore::new("/nonexistent"),
        )
    }

    fn folder(path: &str, change: i64) -> Folder {
        Folder {
            fs: test_fs(),
            path: path.to_owned(),
            change,
            listing: Mutex::new(None),
        }
    }

    #[test]
    fn listing_path_shapes() {
        assert_eq!(folder("", 700).listing_path(), "//*@700");
        assert_eq!(folder("depot", 700).listing_path(), "//depot/*@700");
        assert_eq!(folder("depot/src", 12).listing_path(), "//depot/src/*@12");
    }

    #[test]
    fn basename_takes_last_segment() {
        assert_eq!(basename("//depot/src/main.c"), "main.c");
        assert_eq!(basename("//depot"), "depot");
        assert_eq!(basename("plain"), "plain");
    }

    #[test]
    fn join_path_skips_empty_base() {
        assert_eq!(join_path("", "depot"), "depot");
        assert_eq!(join_path("depot", "src"), "depot/src");
    }

    #[test]
    fn head_type_drives_mode() {
        let mut stat = Stat {
            depot_file: "//depot/f".to_owned(),
            head_type: "text".to_owned(),
            file_size: 12,
            head_time: 1_700_000_000,
            ..Stat::default()
        };
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            file_attr(&stat),
            NodeAttr::RegularFile {
                perm: 0o644,
                size: 12,
                mtime,
            }
        );

        for exec in ["xtext", "xbinary", "kxtext"] {
            stat.head_type = exec.to_owned();
            assert_eq!(
                file_attr(&stat),
                NodeAttr::RegularFile {
                    perm: 0o755,
                    size: 12,
                    mtime,
                }
            );
        }

        stat.head_type = "symlink".to_owned();
        assert_eq!(file_attr(&stat), NodeAttr::Symlink { perm: 0o777 });

        // Unrecognized types default to a plain file.
        stat.head_type = "utf16".to_owned();
        assert!(matches!(
            file_attr(&stat),
            NodeAttr::RegularFile { perm: 0o644, .. }
        ));
    }

    #[test]
    fn negative_metadata_clamps_to_zero() {
        let stat = Stat {
            depot_file: "//depot/f".to_owned(),
            head_type: "text".to_owned(),
            file_size: -5,
            head_time: -1,
            ..Stat::default()
        };
        assert_eq!(
            file_attr(&stat),
            NodeAttr::RegularFile {
                perm: 0o644,
                size: 0,
                mtime: UNIX_EPOCH,
            }
        );
    }
}
