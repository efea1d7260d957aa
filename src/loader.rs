//! Document tree loader.
//!
//! Walks a content directory and builds a [`TreeNode`] per directory, with a
//! [`TestRecord`] per Markdown document that carries a metadata header.

use crate::blocks::{TestCase, extract_cases};
use crate::schema::{FrontMatter, SuiteConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for discovery operations. All of them abort the run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Failed to read a directory or file.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A document header or suite config is not valid YAML.
    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    /// A suite config is not valid TOML.
    #[error("invalid TOML in {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// The glob filter does not compile.
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Suite configuration file names, in lookup order.
pub const SUITE_CONFIG_FILENAMES: [&str; 3] = ["mdtest.yaml", "mdtest.yml", "mdtest.toml"];

/// Documents with these names describe their directory.
pub const INDEX_FILENAMES: [&str; 3] = ["_index.md", "index.md", "README.md"];

/// An empty file with this name disables a directory's own tests.
pub const DISABLE_MARKER: &str = ".notest";

/// Title of a directory node until an index document names it.
pub const UNTITLED: &str = "Unknown";

/// Title of the content root when it has no index document.
pub const ROOT_TITLE: &str = "Root";

/// Weight given to an index document's own test record, so that it sorts
/// deterministically among its sibling documents.
const INDEX_TEST_WEIGHT: i64 = 1;

/// One directory of the content tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub title: String,
    pub weight: i64,
    /// The directory itself.
    pub dir: PathBuf,
    /// The index document that named this directory, if any.
    pub path: Option<PathBuf>,
    /// False when the directory carries the disable marker.
    pub run: bool,
    pub children: Vec<TreeNode>,
    pub tests: Vec<TestRecord>,
}

/// One document with a metadata header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
    pub title: String,
    pub weight: i64,
    pub cases: Vec<TestCase>,
    /// The directory the document lives in.
    pub source_path: PathBuf,
}

/// Options that shape extraction while scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Fence language of executable blocks.
    pub language: String,
    /// Timeout for blocks that set none, when the document sets none either.
    pub default_timeout: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            language: "bash".to_string(),
            default_timeout: 10,
        }
    }
}

/// Load suite configuration from a directory.
///
/// Looks for `mdtest.yaml`, `mdtest.yml` or `mdtest.toml` in the given directory.
/// Returns `None` if none exists, `Err` if one exists but is invalid.
pub fn load_suite_config(dir: &Path) -> Result<Option<SuiteConfig>, DiscoveryError> {
    let Some(config_path) = SUITE_CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
    else {
        return Ok(None);
    };

    let contents = read_file(&config_path)?;
    let config = if config_path.extension().is_some_and(|e| e == "toml") {
        toml::from_str(&contents).map_err(|source| DiscoveryError::Toml {
            path: config_path.clone(),
            source,
        })?
    } else {
        serde_yaml::from_str(&contents).map_err(|source| DiscoveryError::Yaml {
            path: config_path.clone(),
            source,
        })?
    };
    Ok(Some(config))
}

/// Scan a content root into a tree.
pub fn scan(root: &Path, options: &ScanOptions) -> Result<TreeNode, DiscoveryError> {
    let mut node = scan_dir(root, options)?;
    if node.path.is_none() {
        node.title = ROOT_TITLE.to_string();
    }
    Ok(node)
}

/// Build the node for one directory, recursing depth-first into
/// subdirectories in file-name order.
fn scan_dir(dir: &Path, options: &ScanOptions) -> Result<TreeNode, DiscoveryError> {
    let io_err = |source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.sort();

    let mut run = true;
    let mut children = Vec::new();
    let mut documents = Vec::new();

    for path in entries {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if path.is_dir() {
            children.push(scan_dir(&path, options)?);
        } else if name == DISABLE_MARKER {
            run = false;
        } else if is_document(name) {
            let rank = INDEX_FILENAMES.iter().position(|index| *index == name);
            if let Some(record) = load_document(&path, dir, options)? {
                documents.push((rank, path, record));
            }
        }
    }

    // The index is the titled document whose name comes first in INDEX_FILENAMES.
    let index = documents
        .iter()
        .enumerate()
        .filter_map(|(i, (rank, _, _))| rank.map(|rank| (rank, i)))
        .min()
        .map(|(_, i)| i);

    let mut title = UNTITLED.to_string();
    let mut weight = 0;
    let mut index_path = None;
    let mut tests = Vec::with_capacity(documents.len());
    for (i, (_, path, mut record)) in documents.into_iter().enumerate() {
        if Some(i) == index {
            title = record.title.clone();
            weight = record.weight;
            index_path = Some(path);
            record.weight = INDEX_TEST_WEIGHT;
        }
        tests.push(record);
    }

    if !run {
        tracing::debug!("Execution disabled for {}", dir.display());
    }

    Ok(TreeNode {
        title,
        weight,
        dir: dir.to_path_buf(),
        path: index_path,
        run,
        children,
        tests,
    })
}

fn is_document(name: &str) -> bool {
    name.ends_with(".md") || name.ends_with(".markdown")
}

/// Read one document. Returns `None` when it is not a test.
fn load_document(
    path: &Path,
    dir: &Path,
    options: &ScanOptions,
) -> Result<Option<TestRecord>, DiscoveryError> {
    let contents = read_file(path)?;

    let Some((header, body)) = split_front_matter(&contents) else {
        tracing::debug!("No metadata header in {}, skipping", path.display());
        return Ok(None);
    };

    let front_matter: FrontMatter = if header.trim().is_empty() {
        FrontMatter::default()
    } else {
        serde_yaml::from_str(header).map_err(|source| DiscoveryError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };

    let Some(title) = front_matter.title else {
        tracing::warn!("Metadata header in {} has no title, skipping", path.display());
        return Ok(None);
    };

    let timeout = front_matter.timeout.unwrap_or(options.default_timeout);
    let cases = extract_cases(body, dir, &options.language, timeout);

    Ok(Some(TestRecord {
        title,
        weight: front_matter.weight,
        cases,
        source_path: dir.to_path_buf(),
    }))
}

/// Split a document into its YAML header and body.
///
/// The header must open on the first line with `---` and close with a line
/// holding only `---`.
fn split_front_matter(contents: &str) -> Option<(&str, &str)> {
    let contents = contents.strip_prefix('\u{feff}').unwrap_or(contents);
    let rest = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((header, body));
        }
        offset += line.len();
    }
    None
}

fn read_file(path: &Path) -> Result<String, DiscoveryError> {
    std::fs::read_to_string(path).map_err(|source| DiscoveryError::Io {
        path: path.to_path_buf(),
        source,
    })
}
