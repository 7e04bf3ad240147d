//! Content-addressed backing store for materialized file revisions.
//!
//! Keys are identity strings (`<depot-path>#<rev>`). The on-disk layout is
//! `<root>/<ab>/<rest>` where `ab` is the first two hex characters of the
//! MD5 of the identity; two nibbles give 256 buckets, which keeps any one
//! directory small no matter how many changelists get browsed. Entries are
//! immutable and never evicted, so a store directory can be reused across
//! mounts.

use std::fs::DirBuilder;
use std::io::Write as _;
use std::os::unix::fs::DirBuilderExt as _;
use std::path::{Path, PathBuf};

use md5::{Digest as _, Md5};
use tempfile::NamedTempFile;
use tracing::debug;

/// Directory mode for shard buckets.
const SHARD_MODE: u32 = 0o700;

#[derive(Debug)]
pub struct BackingStore {
    root: PathBuf,
}

impl BackingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_paths(&self, identity: &str) -> (PathBuf, String) {
        let digest = hex::encode(Md5::digest(identity.as_bytes()));
        (self.root.join(&digest[..2]), digest[2..].to_owned())
    }

    /// The path an entry for `identity` lives at, whether or not it exists.
    pub fn entry_path(&self, identity: &str) -> PathBuf {
        let (shard, leaf) = self.shard_paths(identity);
        shard.join(leaf)
    }

    /// Whether `identity` has already been materialized.
    pub fn contains(&self, identity: &str) -> bool {
        self.entry_path(identity).is_file()
    }

    /// Write `content` for `identity`, creating the shard bucket on demand.
    ///
    /// The bytes land in a temporary file in the store root (same
    /// filesystem as the final location) and are renamed into place, so
    /// concurrent writers of the same identity race harmlessly: the loser
    /// overwrites an identical entry.
    pub fn insert(&self, identity: &str, content: &[u8]) -> std::io::Result<PathBuf> {
        let (shard, leaf) = self.shard_paths(identity);
        DirBuilder::new()
            .recursive(true)
            .mode(SHARD_MODE)
            .create(&shard)?;

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(content)?;
        let target = shard.join(leaf);
        tmp.persist(&target).map_err(|e| e.error)?;

        debug!(identity, path = %target.display(), bytes = content.len(), "stored revision");
        Ok(target)
    }
}
