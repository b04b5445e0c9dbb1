//! Conversion of native directory entries and namenode records.
//!
//! Conversions run on the worker thread inside the task that produced the
//! native data, before that data is released.

use serde::Serialize;

use crate::driver::{RawNamenode, RawPathInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

impl EntryKind {
    fn from_tag(tag: u8) -> Self {
        match tag {
            b'F' => EntryKind::File,
            b'D' => EntryKind::Directory,
            _ => EntryKind::Other,
        }
    }
}

/// Snapshot of one filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathInfo {
    #[serde(rename = "type")]
    kind: EntryKind,
    path: String,
    size: i64,
    replication: i16,
    block_size: i64,
    owner: String,
    group: String,
    permissions: i16,
    last_mod: i64,
    last_access: i64,
}

impl PathInfo {
    pub(crate) fn from_raw<E: RawPathInfo + ?Sized>(raw: &E) -> Self {
        Self {
            kind: EntryKind::from_tag(raw.kind()),
            path: raw.name().into_owned(),
            size: raw.size(),
            replication: raw.replication(),
            block_size: raw.block_size(),
            owner: raw.owner().into_owned(),
            group: raw.group().into_owned(),
            permissions: raw.permissions(),
            last_mod: raw.last_mod(),
            last_access: raw.last_access(),
        }
    }

    /// Directory listings sometimes carry a doubled leading slash or a
    /// trailing one.
    pub(crate) fn from_listed<E: RawPathInfo + ?Sized>(raw: &E) -> Self {
        let mut info = Self::from_raw(raw);
        info.path = normalize_listed_path(info.path);
        info
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path component; the root is `/`.
    pub fn name(&self) -> &str {
        match self.path.trim_end_matches('/').rsplit_once('/') {
            Some((_, name)) if !name.is_empty() => name,
            _ => &self.path,
        }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn replication(&self) -> i16 {
        self.replication
    }

    pub fn block_size(&self) -> i64 {
        self.block_size
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn permissions(&self) -> i16 {
        self.permissions
    }

    /// Seconds since the epoch.
    pub fn last_mod(&self) -> i64 {
        self.last_mod
    }

    /// Seconds since the epoch.
    pub fn last_access(&self) -> i64 {
        self.last_access
    }
}

pub(crate) fn normalize_listed_path(mut path: String) -> String {
    if path.starts_with("//") {
        path.remove(0);
    } else if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamenodeInfo {
    pub rpc_address: String,
    pub http_address: String,
}

impl NamenodeInfo {
    pub(crate) fn from_raw<N: RawNamenode + ?Sized>(raw: &N) -> Self {
        Self {
            rpc_address: raw.rpc_address().into_owned(),
            http_address: raw.http_address().into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    struct Entry {
        kind: u8,
        name: &'static str,
    }

    impl RawPathInfo for Entry {
        fn kind(&self) -> u8 {
            self.kind
        }
        fn name(&self) -> Cow<'_, str> {
            Cow::Borrowed(self.name)
        }
        fn size(&self) -> i64 {
            42
        }
        fn replication(&self) -> i16 {
            3
        }
        fn block_size(&self) -> i64 {
            128 << 20
        }
        fn owner(&self) -> Cow<'_, str> {
            Cow::Borrowed("alice")
        }
        fn group(&self) -> Cow<'_, str> {
            Cow::Borrowed("staff")
        }
        fn permissions(&self) -> i16 {
            0o644
        }
        fn last_mod(&self) -> i64 {
            1_700_000_000
        }
        fn last_access(&self) -> i64 {
            1_700_000_100
        }
    }

    #[test]
    fn kind_tags_map_to_entry_kinds() {
        let file = PathInfo::from_raw(&Entry { kind: b'F', name: "/f" });
        let dir = PathInfo::from_raw(&Entry { kind: b'D', name: "/d" });
        let other = PathInfo::from_raw(&Entry { kind: b'L', name: "/l" });
        assert!(file.is_file());
        assert!(dir.is_directory());
        assert_eq!(other.kind(), EntryKind::Other);
    }

    #[test]
    fn listed_paths_are_normalized() {
        assert_eq!(normalize_listed_path("//a/b".into()), "/a/b");
        assert_eq!(normalize_listed_path("/a/b/".into()), "/a/b");
        assert_eq!(normalize_listed_path("/".into()), "/");
        let info = PathInfo::from_listed(&Entry { kind: b'D', name: "/x/" });
        assert_eq!(info.path(), "/x");
        assert_eq!(info.name(), "x");
    }

    #[test]
    fn serializes_to_external_shape() {
        let info = PathInfo::from_raw(&Entry { kind: b'D', name: "/a/b" });
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["type"], "directory");
        assert_eq!(v["path"], "/a/b");
        assert_eq!(v["block_size"], 128 << 20);
        assert_eq!(v["last_access"], 1_700_000_100);

        let nn = NamenodeInfo {
            rpc_address: "nn1:8020".into(),
            http_address: "nn1:50070".into(),
        };
        let v = serde_json::to_value(&nn).unwrap();
        assert_eq!(v["rpcAddress"], "nn1:8020");
        assert_eq!(v["httpAddress"], "nn1:50070");
    }
}
