//! Suite tree construction.
//!
//! Turns the discovered [`TreeNode`] tree into the hierarchy that is actually
//! run: disabled and filtered-out directories lose their own tests, and
//! siblings are ordered by weight.

use crate::loader::{TestRecord, TreeNode};
use glob::Pattern;
use serde::Serialize;
use std::path::{Component, Path};

/// A named group of tests, one per directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suite {
    pub title: String,
    pub tests: Vec<TestRecord>,
    pub children: Vec<Suite>,
}

impl Suite {
    /// Number of tests in this suite and all of its descendants.
    pub fn test_count(&self) -> usize {
        self.tests.len() + self.children.iter().map(Suite::test_count).sum::<usize>()
    }

    /// Number of cases in this suite and all of its descendants.
    pub fn case_count(&self) -> usize {
        self.tests.iter().map(|t| t.cases.len()).sum::<usize>()
            + self.children.iter().map(Suite::case_count).sum::<usize>()
    }
}

/// Build the suite hierarchy for a scanned tree.
///
/// `root` is the scanned content root; the glob is matched against each
/// node's index document relative to it. A directory without an index
/// document is never filtered out. Tests and children are stably sorted by
/// ascending weight.
pub fn build_suites(node: TreeNode, root: &Path, glob: Option<&Pattern>) -> Suite {
    let include_tests = node.run
        && glob.is_none_or(|pattern| {
            node.path
                .as_deref()
                .is_none_or(|path| matches(path, root, pattern))
        });

    let tests = if include_tests {
        let mut tests = node.tests;
        tests.sort_by_key(|t| t.weight);
        tests
    } else {
        if !node.run {
            tracing::debug!("Skipping tests of disabled directory {}", node.dir.display());
        }
        Vec::new()
    };

    let mut children = node.children;
    children.sort_by_key(|c| c.weight);

    Suite {
        title: node.title,
        tests,
        children: children
            .into_iter()
            .map(|child| build_suites(child, root, glob))
            .collect(),
    }
}

fn matches(path: &Path, root: &Path, pattern: &Pattern) -> bool {
    let relative = relative_slash_path(path, root);
    let matched = pattern.matches(&relative);
    tracing::debug!("Glob {} against {relative:?}: {matched}", pattern.as_str());
    matched
}

/// `path` relative to `root`, with `/` separators.
fn relative_slash_path(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
