//! p4fs: mount a Perforce depot as a read-only filesystem.
//!
//! Every submitted changelist appears as a numbered directory under the
//! mount point, containing the whole depot as of that change; `head` is a
//! symlink naming the latest changelist. Directory listings are fetched
//! from the depot on demand and frozen; file contents are materialized
//! lazily into a content-addressed on-disk store shared across mounts.

pub mod cache;
pub mod fs;
pub mod p4;
