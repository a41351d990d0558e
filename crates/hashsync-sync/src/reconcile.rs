//! Manifest reconciliation
//!
//! Computes what a run must fetch, what existing content it can reuse and
//! what it must delete. Identity is the content hash: a file anywhere under
//! the install root with the right hash and size satisfies a target entry,
//! whatever its path.

use crate::manifest::Manifest;
use hashsync_types::{ContentHash, LocalFileRecord, ManifestEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory rename applied before new files are placed
///
/// Both paths are relative to the install root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRename {
    /// Current directory name
    pub from: String,
    /// Name the target layout expects
    pub to: String,
}

impl DirectoryRename {
    /// Create a rename
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Absolute source directory
    pub fn from_path(&self, root: &Path) -> PathBuf {
        root.join(&self.from)
    }

    /// Absolute destination directory
    pub fn to_path(&self, root: &Path) -> PathBuf {
        root.join(&self.to)
    }
}

/// Where a path will live once all renames have run
pub fn renamed_path(root: &Path, renames: &[DirectoryRename], path: &Path) -> PathBuf {
    for rename in renames {
        if let Ok(rest) = path.strip_prefix(rename.from_path(root)) {
            return rename.to_path(root).join(rest);
        }
    }
    path.to_path_buf()
}

/// Origin of content for a reused entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuseSource {
    /// The destination already holds the right content
    InPlace,
    /// Copy from a local file that stays where it is
    Local(PathBuf),
    /// Local file about to be deleted or overwritten; it is copied into the
    /// staging area first and placed from there
    Harvested(PathBuf),
}

/// Target entry satisfied without downloading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReuseItem {
    /// Entry being satisfied
    pub entry: ManifestEntry,
    /// Where its content comes from
    pub source: ReuseSource,
}

impl ReuseItem {
    /// Local path the content is read from, before any rename
    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            ReuseSource::InPlace => None,
            ReuseSource::Local(path) | ReuseSource::Harvested(path) => Some(path),
        }
    }
}

/// Local content that must be copied into staging before destructive steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestItem {
    /// Content hash of the file
    pub hash: ContentHash,
    /// Size of the file
    pub size: u64,
    /// Current location
    pub source: PathBuf,
}

/// Result of reconciliation
///
/// `to_fetch` and `to_reuse` together cover every target entry exactly once.
/// Entries sharing a hash each appear individually; [`Self::fetch_blobs`]
/// collapses them to one download per hash.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    /// Entries whose content must be downloaded
    pub to_fetch: Vec<ManifestEntry>,
    /// Entries satisfied by existing local content
    pub to_reuse: Vec<ReuseItem>,
    /// Local files to delete
    pub to_remove: Vec<LocalFileRecord>,
    /// Local files to copy into staging before anything is deleted
    pub to_harvest: Vec<HarvestItem>,
}

impl ReconciliationPlan {
    /// One entry per distinct hash in `to_fetch`
    pub fn fetch_blobs(&self) -> Vec<&ManifestEntry> {
        let mut seen = HashSet::new();
        self.to_fetch
            .iter()
            .filter(|entry| seen.insert(entry.hash))
            .collect()
    }

    /// Bytes to download, counting shared hashes once
    pub fn fetch_bytes(&self) -> u64 {
        self.fetch_blobs().iter().map(|entry| entry.size).sum()
    }

    /// Entries whose destination must be written
    pub fn placements(&self) -> usize {
        self.to_fetch.len()
            + self
                .to_reuse
                .iter()
                .filter(|item| item.source != ReuseSource::InPlace)
                .count()
    }

    /// Whether the tree already matches the target
    pub fn is_noop(&self) -> bool {
        self.to_fetch.is_empty() && self.to_remove.is_empty() && self.placements() == 0
    }
}

/// Computes a [`ReconciliationPlan`] for one install root
#[derive(Debug, Clone)]
pub struct Reconciler {
    install_root: PathBuf,
    renames: Vec<DirectoryRename>,
    reuse_local: bool,
}

impl Reconciler {
    /// Reconciler for `install_root` that reuses local content
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            renames: Vec::new(),
            reuse_local: true,
        }
    }

    /// Directory renames that run before placement
    pub fn with_renames(mut self, renames: Vec<DirectoryRename>) -> Self {
        self.renames = renames;
        self
    }

    /// Disable reuse of local content (every entry is fetched or taken from staging)
    pub fn reuse_local(mut self, enabled: bool) -> Self {
        self.reuse_local = enabled;
        self
    }

    /// Reconcile `target` against the scanned tree
    ///
    /// `source` describes the currently applied state (migration). Files it
    /// lists that the target does not place are removed, as are the target's
    /// explicit `delete_files`. Without a source, unknown local files are
    /// never touched.
    pub fn reconcile(
        &self,
        target: &Manifest,
        local: &[LocalFileRecord],
        source: Option<&Manifest>,
    ) -> ReconciliationPlan {
        let root = &self.install_root;

        // Local files as they will be addressed after renames
        let by_future_path: HashMap<PathBuf, &LocalFileRecord> = local
            .iter()
            .map(|record| (renamed_path(root, &self.renames, &record.path), record))
            .collect();

        let destinations: HashMap<PathBuf, &ManifestEntry> = target
            .entries
            .iter()
            .map(|entry| (entry.destination(root), entry))
            .collect();

        let to_remove = self.removals(target, source, local, &by_future_path, &destinations);
        let removed: HashSet<PathBuf> = to_remove.iter().map(|r| r.path.clone()).collect();

        // A local file is at risk when it will be deleted or overwritten
        // with different content
        let at_risk = |record: &LocalFileRecord| {
            removed.contains(&record.path)
                || destinations
                    .get(&renamed_path(root, &self.renames, &record.path))
                    .is_some_and(|entry| entry.hash != record.hash)
        };

        let mut by_hash: HashMap<ContentHash, Vec<&LocalFileRecord>> = HashMap::new();
        if self.reuse_local {
            for record in local {
                by_hash.entry(record.hash).or_default().push(record);
            }
            // Stable candidates first
            for candidates in by_hash.values_mut() {
                candidates.sort_by_key(|record| at_risk(*record));
            }
        }

        let mut plan = ReconciliationPlan {
            to_remove,
            ..ReconciliationPlan::default()
        };
        let mut harvested = HashSet::new();

        for entry in &target.entries {
            let destination = entry.destination(root);

            if self.reuse_local {
                if let Some(record) = by_future_path.get(&destination) {
                    if record.hash == entry.hash && record.size == entry.size {
                        plan.to_reuse.push(ReuseItem {
                            entry: entry.clone(),
                            source: ReuseSource::InPlace,
                        });
                        continue;
                    }
                }

                let candidate = by_hash
                    .get(&entry.hash)
                    .and_then(|records| records.iter().find(|r| r.size == entry.size));
                if let Some(record) = candidate {
                    let source = if at_risk(*record) {
                        if harvested.insert(record.hash) {
                            plan.to_harvest.push(HarvestItem {
                                hash: record.hash,
                                size: record.size,
                                source: record.path.clone(),
                            });
                        }
                        ReuseSource::Harvested(record.path.clone())
                    } else {
                        ReuseSource::Local(record.path.clone())
                    };
                    plan.to_reuse.push(ReuseItem {
                        entry: entry.clone(),
                        source,
                    });
                    continue;
                }
            }

            plan.to_fetch.push(entry.clone());
        }

        info!(
            "Reconciled {} entries: {} to fetch ({} blobs, {} bytes), {} reused, {} to remove, {} to harvest",
            target.len(),
            plan.to_fetch.len(),
            plan.fetch_blobs().len(),
            plan.fetch_bytes(),
            plan.to_reuse.len(),
            plan.to_remove.len(),
            plan.to_harvest.len()
        );
        plan
    }

    fn removals(
        &self,
        target: &Manifest,
        source: Option<&Manifest>,
        local: &[LocalFileRecord],
        by_future_path: &HashMap<PathBuf, &LocalFileRecord>,
        destinations: &HashMap<PathBuf, &ManifestEntry>,
    ) -> Vec<LocalFileRecord> {
        let root = &self.install_root;
        let by_path: HashMap<&Path, &LocalFileRecord> =
            local.iter().map(|r| (r.path.as_path(), r)).collect();

        // Source names describe the tree as it is now
        let superseded = source
            .into_iter()
            .flat_map(|manifest| manifest.entries.iter())
            .filter_map(|entry| by_path.get(entry.destination(root).as_path()).copied());
        // Explicit deletions name paths of the target layout
        let explicit = target
            .delete_files
            .iter()
            .filter_map(|name| by_future_path.get(&root.join(relative(name))).copied());

        let mut seen = HashSet::new();
        let mut removals = Vec::new();
        for record in superseded.chain(explicit) {
            let future = renamed_path(root, &self.renames, &record.path);
            if destinations.contains_key(&future) || !seen.insert(record.path.clone()) {
                continue;
            }
            debug!("Scheduling removal of '{}'", record.path.display());
            removals.push(record.clone());
        }
        removals
    }
}

fn relative(name: &str) -> PathBuf {
    name.split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;
    use proptest::prelude::*;

    fn entry(name: &str, content: &[u8]) -> ManifestEntry {
        ManifestEntry::new(name, hash_bytes(content), content.len() as u64)
    }

    fn record(root: &Path, rel: &str, content: &[u8]) -> LocalFileRecord {
        LocalFileRecord {
            path: root.join(rel),
            size: content.len() as u64,
            hash: hash_bytes(content),
        }
    }

    fn root() -> PathBuf {
        PathBuf::from("/install")
    }

    #[test]
    fn test_fresh_install_fetches_everything() {
        let target = Manifest::new(vec![
            entry("A", b"same content"),
            entry("B", b"same content"),
            entry("C", b"other"),
        ]);
        let plan = Reconciler::new(root()).reconcile(&target, &[], None);

        assert_eq!(plan.to_fetch.len(), 3);
        assert_eq!(plan.fetch_blobs().len(), 2);
        assert_eq!(plan.fetch_bytes(), 12 + 5);
        assert!(plan.to_reuse.is_empty());
    }

    #[test]
    fn test_synced_tree_is_noop() {
        let target = Manifest::new(vec![entry("bin/app", b"v2"), entry("data/x", b"x")]);
        let local = vec![
            record(&root(), "bin/app", b"v2"),
            record(&root(), "data/x", b"x"),
            record(&root(), "user/settings.ini", b"mine"),
        ];
        let plan = Reconciler::new(root()).reconcile(&target, &local, None);

        assert!(plan.is_noop());
        assert!(plan
            .to_reuse
            .iter()
            .all(|item| item.source == ReuseSource::InPlace));
    }

    #[test]
    fn test_relocated_file_is_reused_by_hash() {
        let target = Manifest::new(vec![entry("new/place.pak", b"payload")]);
        let local = vec![record(&root(), "old/place.pak", b"payload")];
        let plan = Reconciler::new(root()).reconcile(&target, &local, None);

        assert!(plan.to_fetch.is_empty());
        assert_eq!(
            plan.to_reuse[0].source,
            ReuseSource::Local(root().join("old/place.pak"))
        );
        // Self-update never deletes unknown files
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn test_size_mismatch_is_not_reused() {
        let mut wanted = entry("a", b"payload");
        wanted.size += 1;
        let target = Manifest::new(vec![wanted]);
        let local = vec![record(&root(), "a", b"payload")];

        let plan = Reconciler::new(root()).reconcile(&target, &local, None);
        assert_eq!(plan.to_fetch.len(), 1);
    }

    #[test]
    fn test_migration_removes_superseded_and_harvests() {
        let source = Manifest::new(vec![
            entry("Data_CN/shared.blk", b"shared"),
            entry("Data_CN/cn_only.blk", b"cn"),
            entry("cn_sdk.dll", b"sdk-cn"),
        ]);
        let target = Manifest::new(vec![
            entry("Data_OS/shared.blk", b"shared"),
            entry("os_sdk.dll", b"sdk-cn"),
            entry("Data_OS/os_only.blk", b"os"),
        ]);
        let local = vec![
            record(&root(), "Data_CN/shared.blk", b"shared"),
            record(&root(), "Data_CN/cn_only.blk", b"cn"),
            record(&root(), "cn_sdk.dll", b"sdk-cn"),
        ];

        let plan = Reconciler::new(root())
            .with_renames(vec![DirectoryRename::new("Data_CN", "Data_OS")])
            .reconcile(&target, &local, Some(&source));

        // shared.blk lands in place once the folder is renamed
        let shared = plan
            .to_reuse
            .iter()
            .find(|i| i.entry.remote_name == "Data_OS/shared.blk")
            .unwrap();
        assert_eq!(shared.source, ReuseSource::InPlace);

        // sdk content is reused but its old path is deleted, so it is harvested
        let sdk = plan
            .to_reuse
            .iter()
            .find(|i| i.entry.remote_name == "os_sdk.dll")
            .unwrap();
        assert_eq!(sdk.source, ReuseSource::Harvested(root().join("cn_sdk.dll")));
        assert_eq!(plan.to_harvest.len(), 1);

        let mut removed: Vec<_> = plan.to_remove.iter().map(|r| r.path.clone()).collect();
        removed.sort();
        assert_eq!(
            removed,
            vec![root().join("Data_CN/cn_only.blk"), root().join("cn_sdk.dll")]
        );

        assert_eq!(plan.to_fetch.len(), 1);
        assert_eq!(plan.to_fetch[0].remote_name, "Data_OS/os_only.blk");
    }

    #[test]
    fn test_overwritten_source_is_harvested() {
        // a.bin moves to b.bin while a.bin receives new content
        let target = Manifest::new(vec![entry("b.bin", b"old a"), entry("a.bin", b"new a")]);
        let local = vec![record(&root(), "a.bin", b"old a")];

        let plan = Reconciler::new(root()).reconcile(&target, &local, None);

        assert_eq!(
            plan.to_reuse[0].source,
            ReuseSource::Harvested(root().join("a.bin"))
        );
        assert_eq!(plan.to_fetch.len(), 1);
    }

    #[test]
    fn test_stable_copy_preferred_over_doomed_one() {
        let source = Manifest::new(vec![entry("doomed.bin", b"blob")]);
        let target = Manifest::new(vec![entry("keep.bin", b"blob"), entry("new.bin", b"blob")]);
        let local = vec![
            record(&root(), "doomed.bin", b"blob"),
            record(&root(), "keep.bin", b"blob"),
        ];

        let plan = Reconciler::new(root()).reconcile(&target, &local, Some(&source));
        let new = plan
            .to_reuse
            .iter()
            .find(|i| i.entry.remote_name == "new.bin")
            .unwrap();
        assert_eq!(new.source, ReuseSource::Local(root().join("keep.bin")));
        assert!(plan.to_harvest.is_empty());
    }

    #[test]
    fn test_explicit_delete_list() {
        let target = Manifest::new(vec![entry("app", b"v2")])
            .with_delete_files(vec!["legacy/plugin.dll".to_string(), "app".to_string()]);
        let local = vec![
            record(&root(), "app", b"v1"),
            record(&root(), "legacy/plugin.dll", b"old"),
        ];

        let plan = Reconciler::new(root()).reconcile(&target, &local, None);
        assert_eq!(plan.to_remove.len(), 1);
        assert_eq!(plan.to_remove[0].path, root().join("legacy/plugin.dll"));
    }

    #[test]
    fn test_reinstall_ignores_local_content() {
        let target = Manifest::new(vec![entry("a", b"x")]);
        let local = vec![record(&root(), "a", b"x")];

        let plan = Reconciler::new(root())
            .reuse_local(false)
            .reconcile(&target, &local, None);
        assert_eq!(plan.to_fetch.len(), 1);
        assert!(plan.to_reuse.is_empty());
    }

    #[test]
    fn test_renamed_path() {
        let renames = vec![DirectoryRename::new("Old_Data", "New_Data")];
        assert_eq!(
            renamed_path(&root(), &renames, &root().join("Old_Data/x/y.bin")),
            root().join("New_Data/x/y.bin")
        );
        assert_eq!(
            renamed_path(&root(), &renames, &root().join("Old_Data_Extra/z")),
            root().join("Old_Data_Extra/z")
        );
    }

    fn arb_case() -> impl Strategy<Value = (Vec<(usize, u8)>, Vec<(usize, u8)>, Vec<usize>)> {
        (
            prop::collection::vec((0usize..12, 0u8..5), 0..12),
            prop::collection::vec((0usize..12, 0u8..5), 0..12),
            prop::collection::vec(0usize..12, 0..6),
        )
    }

    proptest! {
        #[test]
        fn test_plan_covers_target_exactly_once((target_layout, local_layout, source_layout) in arb_case()) {
            let mut names = HashSet::new();
            let target = Manifest::new(
                target_layout
                    .iter()
                    .filter(|(name, _)| names.insert(*name))
                    .map(|(name, content)| entry(&format!("f{name}"), &[*content]))
                    .collect(),
            );
            let mut local_names = HashSet::new();
            let local: Vec<_> = local_layout
                .iter()
                .filter(|(name, _)| local_names.insert(*name))
                .map(|(name, content)| record(&root(), &format!("f{name}"), &[*content]))
                .collect();
            let source = Manifest::new(
                source_layout
                    .iter()
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .map(|name| entry(&format!("f{name}"), b"?"))
                    .collect(),
            );

            let plan = Reconciler::new(root()).reconcile(&target, &local, Some(&source));

            let mut covered: Vec<&str> = plan
                .to_fetch
                .iter()
                .map(|e| e.remote_name.as_str())
                .chain(plan.to_reuse.iter().map(|i| i.entry.remote_name.as_str()))
                .collect();
            covered.sort_unstable();
            let mut expected: Vec<&str> = target.entries.iter().map(|e| e.remote_name.as_str()).collect();
            expected.sort_unstable();
            prop_assert_eq!(covered, expected);

            // Nothing read directly from the tree is also deleted
            let removed: HashSet<_> = plan.to_remove.iter().map(|r| r.path.clone()).collect();
            for item in &plan.to_reuse {
                if let ReuseSource::Local(path) = &item.source {
                    prop_assert!(!removed.contains(path));
                }
            }

            // Every local hit is really a hash-and-size match
            for item in &plan.to_reuse {
                if let Some(path) = item.source_path() {
                    let rec = local.iter().find(|r| &r.path == path).unwrap();
                    prop_assert_eq!(rec.hash, item.entry.hash);
                    prop_assert_eq!(rec.size, item.entry.size);
                }
            }
        }
    }
}
