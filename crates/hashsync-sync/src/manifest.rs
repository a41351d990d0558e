//! Target manifests
//!
//! A manifest names every file of the desired tree together with its SHA-256
//! and size. Two encodings are accepted: a JSON document and a JSON-lines
//! package listing with one entry per line.

use hashsync_types::{ContentHash, Error, ManifestEntry, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Desired state of an install tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Files of the target tree
    pub entries: Vec<ManifestEntry>,
    /// Base URL for entries without an explicit URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_prefix: Option<String>,
    /// Paths the target state no longer contains and that must be deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default, alias = "urlPrefix")]
    url_prefix: Option<String>,
    #[serde(alias = "files")]
    entries: Vec<RawEntry>,
    #[serde(default, alias = "deleteFiles")]
    delete_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(alias = "remoteName")]
    remote_name: String,
    #[serde(alias = "sha256", alias = "contentHash")]
    hash: String,
    #[serde(alias = "fileSize")]
    size: u64,
    #[serde(default, alias = "sourceURL")]
    url: Option<String>,
}

impl RawEntry {
    fn into_entry(self) -> Result<ManifestEntry> {
        let hash = ContentHash::from_hex(&self.hash).map_err(|e| {
            Error::manifest(format!("Entry '{}': {}", self.remote_name, e))
        })?;
        Ok(ManifestEntry {
            remote_name: self.remote_name,
            hash,
            size: self.size,
            url: self.url.filter(|url| !url.trim().is_empty()),
        })
    }
}

impl Manifest {
    /// Create a manifest from entries
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    /// Set the base URL for entries without their own URL
    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into());
        self
    }

    /// Set the explicit deletion list
    pub fn with_delete_files(mut self, paths: Vec<String>) -> Self {
        self.delete_files = paths;
        self
    }

    /// Parse either encoding and validate the result
    pub fn parse(text: &str) -> Result<Self> {
        let manifest = match serde_json::from_str::<RawDocument>(text) {
            Ok(doc) => Self {
                entries: doc
                    .entries
                    .into_iter()
                    .map(RawEntry::into_entry)
                    .collect::<Result<_>>()?,
                url_prefix: doc.url_prefix.filter(|p| !p.trim().is_empty()),
                delete_files: doc.delete_files,
            },
            Err(_) => Self::parse_lines(text)?,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a JSON-lines package listing
    fn parse_lines(text: &str) -> Result<Self> {
        let entries = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                serde_json::from_str::<RawEntry>(line)
                    .map_err(|e| Error::manifest(format!("Line {}: {}", number + 1, e)))
                    .and_then(RawEntry::into_entry)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(entries))
    }

    /// Read and parse a manifest file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::io_at(path, "read manifest", &e))?;
        Self::parse(&text)
    }

    /// Check names are unique, relative and free of parent components
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            check_relative(&entry.remote_name)?;
            if !seen.insert(normalize(&entry.remote_name)) {
                return Err(Error::manifest(format!(
                    "Duplicate entry '{}'",
                    entry.remote_name
                )));
            }
        }
        for path in &self.delete_files {
            check_relative(path)?;
        }
        Ok(())
    }

    /// Download URL of an entry: its own URL, else a prefix joined with its name
    pub fn resolve_url(&self, entry: &ManifestEntry, fallback_prefix: Option<&str>) -> Result<String> {
        if let Some(url) = &entry.url {
            return Ok(url.clone());
        }
        let prefix = self
            .url_prefix
            .as_deref()
            .or(fallback_prefix)
            .ok_or_else(|| {
                Error::manifest(format!(
                    "No download URL for '{}' and no URL prefix configured",
                    entry.remote_name
                ))
            })?;
        Ok(format!(
            "{}/{}",
            prefix.trim_end_matches('/'),
            normalize(&entry.remote_name)
        ))
    }

    /// Sum of all entry sizes
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `/` separated form without empty segments
fn normalize(name: &str) -> String {
    name.split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn check_relative(name: &str) -> Result<()> {
    let invalid = |why: &str| Error::manifest(format!("Invalid path '{}': {}", name, why));

    if name.trim().is_empty() {
        return Err(invalid("empty"));
    }
    if name.starts_with('/') || name.starts_with('\\') || name.contains(':') {
        return Err(invalid("must be relative"));
    }
    if name
        .split(['/', '\\'])
        .any(|part| part == ".." || part == ".")
    {
        return Err(invalid("must not contain '.' or '..' segments"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const H1: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const H2: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_document() {
        let text = format!(
            r#"{{
                "url_prefix": "https://cdn.example.com/v2/",
                "entries": [
                    {{"remote_name": "bin/app", "hash": "{H1}", "size": 5}},
                    {{"remote_name": "data/empty", "hash": "{H2}", "size": 0,
                      "url": "https://mirror.example.com/empty"}}
                ],
                "delete_files": ["bin/old-app"]
            }}"#
        );
        let manifest = Manifest::parse(&text).unwrap();

        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.delete_files, vec!["bin/old-app".to_string()]);
        assert_eq!(
            manifest.resolve_url(&manifest.entries[0], None).unwrap(),
            "https://cdn.example.com/v2/bin/app"
        );
        assert_eq!(
            manifest.resolve_url(&manifest.entries[1], None).unwrap(),
            "https://mirror.example.com/empty"
        );
        assert_eq!(manifest.total_size(), 5);
    }

    #[test]
    fn test_parse_package_lines() {
        let text = format!(
            "{{\"remoteName\": \"Game_Data/a.blk\", \"sha256\": \"{H1}\", \"fileSize\": 5}}\n\n\
             {{\"remoteName\": \"b.dll\", \"sha256\": \"{}\", \"fileSize\": 0}}\n",
            H2.to_uppercase()
        );
        let manifest = Manifest::parse(&text).unwrap();

        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.entries[0].remote_name, "Game_Data/a.blk");
        assert_eq!(manifest.entries[1].hash.to_hex(), H2);
        assert!(manifest.url_prefix.is_none());
    }

    #[test]
    fn test_resolve_url_uses_fallback_prefix() {
        let manifest = Manifest::parse(&format!(
            "{{\"remoteName\": \"sub\\\\file.bin\", \"sha256\": \"{H1}\", \"fileSize\": 5}}"
        ))
        .unwrap();

        assert!(manifest.resolve_url(&manifest.entries[0], None).is_err());
        assert_eq!(
            manifest
                .resolve_url(&manifest.entries[0], Some("http://host/root"))
                .unwrap(),
            "http://host/root/sub/file.bin"
        );
    }

    #[test]
    fn test_shared_hash_is_legal() {
        let text = format!(
            "{{\"remoteName\": \"a\", \"sha256\": \"{H1}\", \"fileSize\": 5}}\n\
             {{\"remoteName\": \"b\", \"sha256\": \"{H1}\", \"fileSize\": 5}}"
        );
        assert_eq!(Manifest::parse(&text).unwrap().len(), 2);
    }

    #[rstest]
    #[case("a", "a")]
    #[case("dir/a", "dir//a")]
    #[case("dir/a", "dir\\a")]
    fn test_duplicate_names_rejected(#[case] first: &str, #[case] second: &str) {
        let hash = ContentHash::from_hex(H1).unwrap();
        let manifest = Manifest::new(vec![
            ManifestEntry::new(first, hash, 5),
            ManifestEntry::new(second, hash, 5),
        ]);
        assert!(manifest.validate().is_err());
    }

    #[rstest]
    #[case("../escape")]
    #[case("/etc/passwd")]
    #[case("C:\\Windows\\x")]
    #[case("a/./b")]
    #[case("   ")]
    fn test_unsafe_names_rejected(#[case] name: &str) {
        let hash = ContentHash::from_hex(H1).unwrap();
        let manifest = Manifest::new(vec![ManifestEntry::new(name, hash, 5)]);
        assert!(matches!(manifest.validate(), Err(Error::Manifest { .. })));
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let text = format!(
            "{{\"remoteName\": \"a\", \"sha256\": \"{H1}\", \"fileSize\": 5}}\nnot json"
        );
        let error = Manifest::parse(&text).unwrap_err().to_string();
        assert!(error.contains("Line 2"), "{}", error);
    }
}
