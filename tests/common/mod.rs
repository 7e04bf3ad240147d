#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

use p4fs::cache::BackingStore;
use p4fs::fs::P4Fs;
use p4fs::p4::{Conn, ConnOptions};

// ---------------------------------------------------------------------------
// Tagged-stream encoders mirroring the client's -G output format.
// ---------------------------------------------------------------------------

pub fn tag_str(s: &str) -> Vec<u8> {
    let mut out = vec![b's'];
    out.extend_from_slice(&(s.len() as i32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out
}

pub fn tag_int(v: i32) -> Vec<u8> {
    let mut out = vec![b'i'];
    out.extend_from_slice(&v.to_le_bytes());
    out
}

pub fn tag_dict(pairs: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut out = vec![b'{'];
    for (k, v) in pairs {
        out.extend_from_slice(&tag_str(k));
        out.extend_from_slice(v);
    }
    out.push(b'0');
    out
}

/// A record whose fields are all strings, the way the client emits data
/// records.
pub fn record(fields: &[(&str, &str)]) -> Vec<u8> {
    let pairs: Vec<(&str, Vec<u8>)> = fields.iter().map(|(k, v)| (*k, tag_str(v))).collect();
    tag_dict(&pairs)
}

/// An error record, with the integer fields the client really sends as
/// int32.
pub fn error_record(severity: i32, generic: i32, data: &str) -> Vec<u8> {
    tag_dict(&[
        ("code", tag_str("error")),
        ("severity", tag_int(severity)),
        ("generic", tag_int(generic)),
        ("data", tag_str(data)),
    ])
}

// ---------------------------------------------------------------------------
// MockDepot
// ---------------------------------------------------------------------------

const SCRIPT: &str = r#"#!/bin/sh
dir="$(dirname "$0")/fixtures"
i=0
while [ -f "$dir/args.$i" ]; do
    if [ "$(cat "$dir/args.$i")" = "$*" ]; then
        cat "$dir/data.$i"
        [ -f "$dir/fail.$i" ] && exit 7
        exit 0
    fi
    i=$((i+1))
done
echo "p4-mock: no fixture for: $*" >&2
exit 1
"#;

/// A fake `p4` binary: a shell script that answers exact argument vectors
/// with canned bytes and exits non-zero for anything unexpected.
pub struct MockDepot {
    dir: TempDir,
    fixtures: AtomicUsize,
}

impl MockDepot {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("fixtures")).unwrap();
        let script = dir.path().join("p4");
        fs::write(&script, SCRIPT).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            dir,
            fixtures: AtomicUsize::new(0),
        }
    }

    pub fn binary(&self) -> String {
        self.dir.path().join("p4").to_str().unwrap().to_owned()
    }

    /// Answer the exact argument vector `args` (space-joined, as `$*` sees
    /// it) with `data` on stdout.
    pub fn expect(&self, args: &str, data: impl AsRef<[u8]>) {
        let n = self.fixtures.fetch_add(1, Ordering::Relaxed);
        let fixtures = self.dir.path().join("fixtures");
        fs::write(fixtures.join(format!("args.{n}")), args).unwrap();
        fs::write(fixtures.join(format!("data.{n}")), data.as_ref()).unwrap();
    }

    /// Like [`MockDepot::expect`], but the client also exits non-zero
    /// after writing `data`, the way `p4` does when some of a command's
    /// arguments fail.
    pub fn expect_failing(&self, args: &str, data: impl AsRef<[u8]>) {
        let n = self.fixtures.fetch_add(1, Ordering::Relaxed);
        let fixtures = self.dir.path().join("fixtures");
        fs::write(fixtures.join(format!("args.{n}")), args).unwrap();
        fs::write(fixtures.join(format!("data.{n}")), data.as_ref()).unwrap();
        fs::write(fixtures.join(format!("fail.{n}")), "").unwrap();
    }

    /// Drop every fixture; any further client invocation fails.
    pub fn clear(&self) {
        let fixtures = self.dir.path().join("fixtures");
        for entry in fs::read_dir(&fixtures).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        self.fixtures.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A node-layer filesystem wired to a mock depot and a fresh backing store.
pub struct Harness {
    pub depot: MockDepot,
    pub backing: TempDir,
    pub fs: Arc<P4Fs>,
}

pub fn harness(depot: MockDepot) -> Harness {
    let backing = tempfile::tempdir().unwrap();
    let conn = Conn::new(ConnOptions {
        binary: depot.binary(),
        address: String::new(),
    });
    let fs = P4Fs::new(conn, BackingStore::new(backing.path()));
    Harness { depot, backing, fs }
}

/// Count regular files anywhere under `dir`.
pub fn count_files(dir: &std::path::Path) -> usize {
    let mut count = 0;
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        if entry.file_type().unwrap().is_dir() {
            count += count_files(&entry.path());
        } else {
            count += 1;
        }
    }
    count
}
