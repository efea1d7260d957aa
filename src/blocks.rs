//! Command block extraction.
//!
//! Parses a document body as CommonMark and turns the top-level fenced code
//! blocks tagged for execution into [`TestCase`]s. The fence's info string
//! carries the language followed by space-separated `key=value` directives:
//!
//! ````markdown
//! ```bash test=true timeout=30 hook=db
//! ./migrate.sh
//! ```
//! ````

use comrak::nodes::NodeValue;
use comrak::{Arena, Options, parse_document};
use serde::Serialize;
use std::path::{Path, PathBuf};

const WAIT_KEY: &str = "wait";
const TIMEOUT_KEY: &str = "timeout";
const TEST_KEY: &str = "test";
const EXPECT_ERROR_KEY: &str = "expectError";
const HOOK_KEY: &str = "hook";

/// One executable command block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    /// Raw shell text of the block.
    pub command: String,
    /// Seconds to pause after the command succeeds.
    pub wait: u64,
    /// Seconds before the command is aborted.
    pub timeout: u64,
    /// Name of the `hook-<name>.sh` script pair to run around the command.
    pub hook: Option<String>,
    /// Standard error output and a non-zero exit status do not fail the case.
    pub expect_error: bool,
    /// Directory of the document the block came from.
    pub directory: PathBuf,
}

impl TestCase {
    /// Location of the hook script, if the case names one.
    pub fn hook_script(&self) -> Option<PathBuf> {
        self.hook
            .as_ref()
            .map(|name| self.directory.join("tests").join(format!("hook-{name}.sh")))
    }
}

/// Directives parsed from a block's info string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Directives {
    wait: u64,
    timeout: Option<u64>,
    test: bool,
    expect_error: bool,
    hook: Option<String>,
}

fn parse_directives(meta: &str) -> Directives {
    let mut directives = Directives::default();

    for token in meta.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            tracing::warn!("Ignoring directive without a value: {token}");
            continue;
        };

        match key {
            WAIT_KEY => {
                if let Some(secs) = parse_secs(key, value) {
                    directives.wait = secs;
                }
            }
            TIMEOUT_KEY => {
                if let Some(secs) = parse_secs(key, value) {
                    directives.timeout = Some(secs);
                }
            }
            TEST_KEY => {
                if let Some(flag) = parse_flag(key, value) {
                    directives.test = flag;
                }
            }
            EXPECT_ERROR_KEY => {
                if let Some(flag) = parse_flag(key, value) {
                    directives.expect_error = flag;
                }
            }
            HOOK_KEY => directives.hook = Some(value.to_string()),
            other => tracing::warn!("Unrecognized param {other} in code block"),
        }
    }

    directives
}

fn parse_secs(key: &str, value: &str) -> Option<u64> {
    match value.parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!("Ignoring {key}={value}: expected a whole number of seconds");
            None
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => {
            tracing::warn!("Ignoring {key}={value}: expected true or false");
            None
        }
    }
}

/// A fenced block found in a document, before directive filtering.
#[derive(Debug, PartialEq, Eq)]
struct FencedBlock {
    lang: String,
    meta: String,
    body: String,
}

/// Collect the fenced code blocks that are direct children of the document,
/// in document order. Blocks nested in lists or block quotes are prose.
fn fenced_blocks(body: &str) -> Vec<FencedBlock> {
    let arena = Arena::new();
    let root = parse_document(&arena, body, &Options::default());

    root.children()
        .filter_map(|node| {
            let data = node.data.borrow();
            let NodeValue::CodeBlock(cb) = &data.value else {
                return None;
            };
            if !cb.fenced {
                return None;
            }
            let info = cb.info.trim();
            let (lang, meta) = match info.split_once(char::is_whitespace) {
                Some((lang, meta)) => (lang, meta.trim()),
                None => (info, ""),
            };
            let literal = cb.literal.strip_suffix('\n').unwrap_or(cb.literal.as_str());
            Some(FencedBlock {
                lang: lang.to_string(),
                meta: meta.to_string(),
                body: literal.to_string(),
            })
        })
        .collect()
}

/// Extract the executable cases of a document body.
///
/// A block is included when its language is `language` and it carries
/// `test=true`. `default_timeout` applies to blocks without `timeout=`.
pub fn extract_cases(
    body: &str,
    directory: &Path,
    language: &str,
    default_timeout: u64,
) -> Vec<TestCase> {
    fenced_blocks(body)
        .into_iter()
        .filter(|block| block.lang == language && !block.body.trim().is_empty())
        .filter_map(|block| {
            let directives = parse_directives(&block.meta);
            if !directives.test {
                return None;
            }
            Some(TestCase {
                command: block.body,
                wait: directives.wait,
                timeout: directives.timeout.unwrap_or(default_timeout),
                hook: directives.hook,
                expect_error: directives.expect_error,
                directory: directory.to_path_buf(),
            })
        })
        .collect()
}
