mod blocks;
mod loader;
mod report;
mod runner;
mod schema;
mod shell;
mod suite;

use clap::{Parser, Subcommand};
use report::OutputFormat;
use runner::{Executor, RunConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mdtest")]
#[command(about = "Automated test framework for Markdown that contains bash scripts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the command blocks of a content tree
    Run {
        /// Path to Markdown content
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Glob for tests to include, relative to the content path (e.g. chapter1/*)
        #[arg(short, long)]
        glob: Option<String>,
        /// Enable debug output
        #[arg(short, long)]
        debug: bool,
        /// Show progress and per-case results
        #[arg(short, long)]
        verbose: bool,
        /// Discover and report tests without executing scripts
        #[arg(long)]
        dry_run: bool,
        /// Timeout in seconds for a whole test
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Default timeout in seconds for a single command block
        #[arg(long)]
        case_timeout: Option<u64>,
        /// Working directory of the shell
        #[arg(short, long)]
        work_dir: Option<PathBuf>,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
    },
    /// Discover tests and print the suite tree without running it
    List {
        /// Path to Markdown content
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Glob for tests to include, relative to the content path
        #[arg(short, long)]
        glob: Option<String>,
        /// Print the suite tree as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scaffold an example document
    Init {
        /// Output path for the new document
        #[arg(default_value = "docs/_index.md")]
        path: PathBuf,
    },
    /// Output the JSON Schema of the suite config and document headers
    Schema,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            glob,
            debug,
            verbose,
            dry_run,
            timeout,
            case_timeout,
            work_dir,
            output,
        } => {
            let mut config = load_config(&path, glob.as_deref());
            if let Some(secs) = timeout {
                config.test_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = case_timeout {
                config.default_case_timeout = secs;
            }
            if let Some(dir) = work_dir {
                config.work_dir = dir;
            }
            config.debug |= debug;
            config.dry_run = dry_run;

            init_logging(config.debug, verbose);

            let suite = build_suite(&path, &config);
            if suite.test_count() == 0 {
                eprintln!("No tests found at: {}", path.display());
                std::process::exit(1);
            }

            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to create runtime: {e}");
                    std::process::exit(1);
                }
            };

            let result = runtime.block_on(async { Executor::new(config).run(&suite).await });
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    eprintln!("Error starting shell: {e}");
                    std::process::exit(1);
                }
            };

            print!("{}", report::render(&result, output, verbose));

            if !result.success() {
                std::process::exit(1);
            }
        }
        Command::List { path, glob, json } => {
            let config = load_config(&path, glob.as_deref());
            init_logging(config.debug, false);
            let suite = build_suite(&path, &config);
            if !json {
                print!("{}", report::format_outline(&suite));
            } else {
                match serde_json::to_string_pretty(&suite) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Failed to serialize suite tree: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }
        Command::Init { path } => {
            let template = r#"---
title: Getting started
weight: 1
---

# Getting started

Blocks run in one shared `bash` session, in document order, when they are
tagged with `test=true`.

```bash test=true
export GREETING="hello"
```

```bash test=true timeout=5
echo "$GREETING, world"
```

Blocks without `test=true` are documentation only:

```bash
echo "this block is not executed"
```
"#;
            if path.exists() {
                eprintln!("Error: file already exists: {}", path.display());
                std::process::exit(1);
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
                && let Err(e) = fs::create_dir_all(parent)
            {
                eprintln!("Error creating directory: {e}");
                std::process::exit(1);
            }
            if let Err(e) = fs::write(&path, template) {
                eprintln!("Error writing file: {e}");
                std::process::exit(1);
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Failed to serialize schema: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Resolve the run configuration from the suite file and a CLI glob.
fn load_config(path: &Path, glob: Option<&str>) -> RunConfig {
    let suite_config = match loader::load_suite_config(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            std::process::exit(1);
        }
    };

    let mut config = match RunConfig::from_suite(path, suite_config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error in suite config: {e}");
            std::process::exit(1);
        }
    };

    // CLI glob overrides suite config
    if let Some(pattern) = glob
        && let Err(e) = config.set_glob(pattern)
    {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    config
}

fn build_suite(path: &Path, config: &RunConfig) -> suite::Suite {
    let tree = match loader::scan(path, &config.scan_options()) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("Error discovering tests: {e}");
            std::process::exit(1);
        }
    };
    suite::build_suites(tree, path, config.glob.as_ref())
}

/// Log to stderr so report output on stdout stays machine-readable.
fn init_logging(debug: bool, verbose: bool) {
    let default = match (debug, verbose) {
        (true, _) => "mdtest=debug",
        (false, true) => "mdtest=info",
        (false, false) => "mdtest=warn",
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .try_init();
}
