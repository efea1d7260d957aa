//! Schema definitions for mdtest input files.
//!
//! Two kinds of file are read from disk: the optional suite configuration
//! (`mdtest.yaml` or `mdtest.toml` in the content root) and the YAML header at
//! the top of each Markdown document.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Suite-level configuration loaded from `mdtest.yaml` in the content root.
///
/// Every field is optional; command-line flags take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SuiteConfig {
    /// Schema version (must match crate major version).
    #[serde(default = "default_version")]
    pub version: u32,

    /// Glob over document paths relative to the content root (e.g. `chapter1/*`).
    #[serde(default)]
    pub glob: Option<String>,

    /// Upper bound in seconds for a whole test (all of its cases).
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Default timeout in seconds for a single command block.
    #[serde(default)]
    pub case_timeout: Option<u64>,

    /// Timeout in seconds for each hook script invocation.
    #[serde(default)]
    pub hook_timeout: Option<u64>,

    /// Working directory of the shell process.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Shell program to spawn (default: `bash`).
    #[serde(default)]
    pub shell: Option<String>,

    /// Fence language that marks a block as executable (default: `bash`).
    #[serde(default)]
    pub language: Option<String>,

    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_version() -> u32 {
    1
}

/// Metadata header at the top of a document.
///
/// Unknown keys are ignored so that site generators can keep their own
/// front matter alongside ours.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FrontMatter {
    /// Test title. A document without one is not a test.
    #[serde(default)]
    pub title: Option<String>,

    /// Sort key among siblings (ascending). Quoted integers are accepted.
    #[serde(default, deserialize_with = "deserialize_weight")]
    #[schemars(with = "i64")]
    pub weight: i64,

    /// Default timeout in seconds for every command block in this document.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn deserialize_weight<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Weight {
        Number(i64),
        Text(String),
    }

    match Weight::deserialize(deserializer)? {
        Weight::Number(weight) => Ok(weight),
        Weight::Text(text) => text.trim().parse().map_err(|_| {
            serde::de::Error::custom(format!("weight must be an integer, got {text:?}"))
        }),
    }
}

/// Combined schema for both input formats.
#[derive(JsonSchema)]
#[allow(dead_code)]
struct Schemas {
    /// `mdtest.yaml` in the content root.
    suite: SuiteConfig,
    /// The YAML header of each document.
    front_matter: FrontMatter,
}

/// Generate the JSON Schema for the suite config and document headers.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Schemas)
}
