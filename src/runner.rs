//! Test execution engine.
//!
//! Runs a suite tree against one persistent shell and captures results.

use crate::blocks::TestCase;
use crate::loader::{DiscoveryError, ScanOptions, TestRecord};
use crate::schema::SuiteConfig;
use crate::shell::{ShellError, ShellSession};
use crate::suite::Suite;
use glob::Pattern;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default upper bound for a whole test, in seconds.
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 200;

/// Default timeout per command block, in seconds.
pub const DEFAULT_CASE_TIMEOUT_SECS: u64 = 10;

/// Default timeout per hook invocation, in seconds.
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 120;

/// Everything a run needs to know, resolved from the suite file and CLI.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory that was scanned for documents.
    pub content_root: PathBuf,
    /// Only directories whose document path matches run their tests.
    pub glob: Option<Pattern>,
    /// Upper bound for all cases of one test.
    pub test_timeout: Duration,
    /// Timeout in seconds for blocks and documents that set none.
    pub default_case_timeout: u64,
    /// Timeout for each hook invocation.
    pub hook_timeout: Duration,
    pub debug: bool,
    /// Discover and report without executing anything.
    pub dry_run: bool,
    /// Working directory of the shell.
    pub work_dir: PathBuf,
    /// Shell program.
    pub shell: String,
    /// Fence language of executable blocks.
    pub language: String,
}

impl RunConfig {
    /// Built-in defaults for a content root.
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
            glob: None,
            test_timeout: Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS),
            default_case_timeout: DEFAULT_CASE_TIMEOUT_SECS,
            hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
            debug: false,
            dry_run: false,
            work_dir: PathBuf::from("."),
            shell: "bash".to_string(),
            language: "bash".to_string(),
        }
    }

    /// Defaults overridden by an optional suite config.
    pub fn from_suite(
        content_root: impl Into<PathBuf>,
        suite: Option<&SuiteConfig>,
    ) -> Result<Self, DiscoveryError> {
        let mut config = Self::new(content_root);
        let Some(suite) = suite else {
            return Ok(config);
        };

        if let Some(pattern) = &suite.glob {
            config.set_glob(pattern)?;
        }
        if let Some(secs) = suite.timeout {
            config.test_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = suite.case_timeout {
            config.default_case_timeout = secs;
        }
        if let Some(secs) = suite.hook_timeout {
            config.hook_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = &suite.work_dir {
            config.work_dir = dir.clone();
        }
        if let Some(shell) = &suite.shell {
            config.shell = shell.clone();
        }
        if let Some(language) = &suite.language {
            config.language = language.clone();
        }
        config.debug = suite.debug;
        Ok(config)
    }

    /// Compile and install a glob filter. An empty pattern clears it.
    pub fn set_glob(&mut self, pattern: &str) -> Result<(), DiscoveryError> {
        if pattern.is_empty() {
            self.glob = None;
            return Ok(());
        }
        let compiled = Pattern::new(pattern).map_err(|source| DiscoveryError::InvalidGlob {
            pattern: pattern.to_string(),
            source,
        })?;
        self.glob = Some(compiled);
        Ok(())
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            language: self.language.clone(),
            default_timeout: self.default_case_timeout,
        }
    }
}

/// Outcome of a test or case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
}

/// Why a test failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The command (or a hook) failed.
    ExitStatus,
    /// The command (or the test as a whole) ran out of time.
    Timeout,
}

/// Details of a failed test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Exit status of the failing command, when it completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Output captured up to the failure.
    pub output: String,
}

/// Result of running a single case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub command: String,
    pub status: Status,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

/// Result of running a single test.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub status: Status,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub cases: Vec<CaseResult>,
}

/// Result of running a suite and its descendants.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub title: String,
    pub tests: Vec<TestResult>,
    pub children: Vec<SuiteResult>,
}

impl SuiteResult {
    /// Count tests with the given status, recursively.
    pub fn count(&self, status: Status) -> usize {
        self.tests.iter().filter(|t| t.status == status).count()
            + self.children.iter().map(|c| c.count(status)).sum::<usize>()
    }

    /// Visit every test with the titles of its enclosing suites.
    pub fn walk<'a>(&'a self, path: &mut Vec<&'a str>, visit: &mut impl FnMut(&[&'a str], &'a TestResult)) {
        path.push(&self.title);
        for test in &self.tests {
            visit(path, test);
        }
        for child in &self.children {
            child.walk(path, visit);
        }
        path.pop();
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub root: SuiteResult,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

impl RunResult {
    pub fn passed(&self) -> usize {
        self.root.count(Status::Passed)
    }

    pub fn failed(&self) -> usize {
        self.root.count(Status::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.root.count(Status::Skipped)
    }

    /// The run succeeds only if no test failed.
    pub fn success(&self) -> bool {
        self.failed() == 0
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Drives a suite tree through one shell session.
pub struct Executor {
    config: RunConfig,
    shell: ShellSession,
}

impl Executor {
    pub fn new(config: RunConfig) -> Self {
        let shell = ShellSession::new(config.shell.clone(), config.work_dir.clone(), config.debug);
        Self { config, shell }
    }

    /// Run every test in the tree.
    ///
    /// The shell is started before the first command and always ended
    /// afterwards. Only a failure to spawn the shell is an error; everything
    /// else is recorded in the result.
    pub async fn run(&mut self, suite: &Suite) -> Result<RunResult, ShellError> {
        let start = Instant::now();
        if !self.config.dry_run {
            self.shell.start()?;
        }
        let root = self.run_suite(suite).await;
        self.shell.end().await;
        Ok(RunResult {
            root,
            duration: start.elapsed(),
        })
    }

    async fn run_suite(&mut self, suite: &Suite) -> SuiteResult {
        tracing::info!("Suite: {}", suite.title);

        let mut tests = Vec::with_capacity(suite.tests.len());
        for test in &suite.tests {
            tests.push(self.run_test(test).await);
        }

        let mut children = Vec::with_capacity(suite.children.len());
        for child in &suite.children {
            children.push(Box::pin(self.run_suite(child)).await);
        }

        SuiteResult {
            title: suite.title.clone(),
            tests,
            children,
        }
    }

    async fn run_test(&mut self, test: &TestRecord) -> TestResult {
        let start = Instant::now();

        if test.cases.is_empty() {
            tracing::info!("Skipping {}: no command blocks", test.title);
            return TestResult {
                name: test.title.clone(),
                status: Status::Skipped,
                duration: start.elapsed(),
                failure: None,
                cases: vec![],
            };
        }

        tracing::info!("Test: {}", test.title);
        let mut cases = Vec::with_capacity(test.cases.len());
        let test_timeout = self.config.test_timeout;
        let outcome = tokio::time::timeout(test_timeout, self.run_cases(test, &mut cases)).await;
        let failure = match outcome {
            Ok(failure) => failure,
            Err(_) => {
                tracing::error!(
                    "Test {} exceeded configured timeout of {}s",
                    test.title,
                    test_timeout.as_secs()
                );
                // The interrupted case is the first without a result.
                let mut rest = test.cases[cases.len()..].iter();
                if let Some(case) = rest.next() {
                    cases.push(case_result(case, Status::Failed, Duration::ZERO));
                }
                cases.extend(rest.map(|case| case_result(case, Status::Skipped, Duration::ZERO)));
                self.reset_shell().await;
                Some(Failure {
                    kind: FailureKind::Timeout,
                    message: format!(
                        "test exceeded configured timeout of {}s",
                        test_timeout.as_secs()
                    ),
                    code: None,
                    output: String::new(),
                })
            }
        };

        TestResult {
            name: test.title.clone(),
            status: if failure.is_some() {
                Status::Failed
            } else {
                Status::Passed
            },
            duration: start.elapsed(),
            failure,
            cases,
        }
    }

    /// Run cases in order. After the first failure the rest are skipped.
    async fn run_cases(
        &mut self,
        test: &TestRecord,
        results: &mut Vec<CaseResult>,
    ) -> Option<Failure> {
        let mut failure = None;
        for case in &test.cases {
            if failure.is_some() {
                results.push(case_result(case, Status::Skipped, Duration::ZERO));
                continue;
            }
            let start = Instant::now();
            match self.run_case(case).await {
                Ok(()) => results.push(case_result(case, Status::Passed, start.elapsed())),
                Err(f) => {
                    tracing::error!("Error running command {}: {}", case.command, f.message);
                    if !f.output.is_empty() {
                        tracing::error!("Output: {}", f.output);
                    }
                    results.push(case_result(case, Status::Failed, start.elapsed()));
                    failure = Some(f);
                }
            }
        }
        failure
    }

    async fn run_case(&mut self, case: &TestCase) -> Result<(), Failure> {
        if self.config.dry_run {
            tracing::debug!("Dry run, not executing:\n{}", case.command);
            return Ok(());
        }

        self.hook(case, "before").await?;

        tracing::debug!("Running script:\n{}", case.command);
        let timeout = Duration::from_secs(case.timeout);
        match self.shell.exec(&case.command, timeout, case.expect_error).await {
            Ok(output) => {
                if !output.stdout.is_empty() {
                    tracing::debug!("Output:\n{}", output.stdout);
                }
                if case.expect_error && !output.stderr.is_empty() {
                    tracing::debug!(
                        "Expected error output (exit status {}):\n{}",
                        output.exit_code,
                        output.stderr
                    );
                }
            }
            Err(e) => return Err(self.failure("command", e).await),
        }

        self.hook(case, "after").await?;

        if case.wait > 0 {
            tracing::debug!("Waiting {}s", case.wait);
            tokio::time::sleep(Duration::from_secs(case.wait)).await;
        }
        Ok(())
    }

    async fn hook(&mut self, case: &TestCase, phase: &str) -> Result<(), Failure> {
        let Some(script) = case.hook_script() else {
            return Ok(());
        };
        let command = format!("{} {} {phase}", self.config.shell, shell_quote(&script));
        tracing::debug!("Running {phase} hook: {command}");
        let timeout = self.config.hook_timeout;
        match self.shell.exec(&command, timeout, false).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let name = case.hook.as_deref().unwrap_or_default();
                Err(self.failure(&format!("{phase} hook {name:?}"), e).await)
            }
        }
    }

    /// Translate a shell error, restarting the shell when its state is unknown.
    async fn failure(&mut self, what: &str, error: ShellError) -> Failure {
        if error.requires_reset() {
            self.reset_shell().await;
        }
        match error {
            ShellError::Timeout { after, output } => Failure {
                kind: FailureKind::Timeout,
                message: format!("{what} exceeded configured timeout of {}s", after.as_secs()),
                code: None,
                output,
            },
            other => {
                let code = match &other {
                    ShellError::CommandFailed { code, .. } => *code,
                    _ => None,
                };
                Failure {
                    kind: FailureKind::ExitStatus,
                    message: format!("{what} failed: {other}"),
                    code,
                    output: other.output().to_string(),
                }
            }
        }
    }

    async fn reset_shell(&mut self) {
        if let Err(e) = self.shell.reset().await {
            tracing::error!("Failed to restart shell: {e}");
        }
    }
}

fn case_result(case: &TestCase, status: Status, duration: Duration) -> CaseResult {
    CaseResult {
        command: case.command.clone(),
        status,
        duration,
    }
}

/// Quote a path for the shell.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn make_case(command: &str, dir: &Path) -> TestCase {
        TestCase {
            command: command.to_string(),
            wait: 0,
            timeout: 5,
            hook: None,
            expect_error: false,
            directory: dir.to_path_buf(),
        }
    }

    fn make_test(title: &str, cases: Vec<TestCase>) -> TestRecord {
        TestRecord {
            title: title.to_string(),
            weight: 0,
            source_path: cases
                .first()
                .map(|c| c.directory.clone())
                .unwrap_or_default(),
            cases,
        }
    }

    fn make_suite(tests: Vec<TestRecord>) -> Suite {
        Suite {
            title: "Root".to_string(),
            tests,
            children: vec![],
        }
    }

    fn config(dir: &TempDir) -> RunConfig {
        let mut config = RunConfig::new(dir.path());
        config.work_dir = dir.path().to_path_buf();
        config
    }

    async fn run(config: RunConfig, suite: &Suite) -> RunResult {
        Executor::new(config).run(suite).await.unwrap()
    }

    // ==================== Basic Execution Tests ====================

    #[tokio::test]
    async fn test_single_passing_case() {
        let dir = tempdir().unwrap();
        let suite = make_suite(vec![make_test("Setup", vec![make_case("echo hi", dir.path())])]);

        let result = run(config(&dir), &suite).await;
        let test = &result.root.tests[0];
        assert_eq!(test.name, "Setup");
        assert_eq!(test.status, Status::Passed, "failure: {:?}", test.failure);
        assert_eq!(test.cases.len(), 1);
        assert_eq!(test.cases[0].status, Status::Passed);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_without_cases_is_skipped() {
        let dir = tempdir().unwrap();
        let suite = make_suite(vec![make_test("Empty", vec![])]);

        let result = run(config(&dir), &suite).await;
        assert_eq!(result.root.tests[0].status, Status::Skipped);
        assert_eq!(result.skipped(), 1);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_shell_state_shared_across_tests() {
        let dir = tempdir().unwrap();
        let suite = make_suite(vec![
            make_test("export", vec![make_case("export SHARED=1", dir.path())]),
            make_test("check", vec![make_case("test \"$SHARED\" = 1", dir.path())]),
        ]);

        let result = run(config(&dir), &suite).await;
        assert_eq!(result.passed(), 2);
    }

    #[tokio::test]
    async fn test_child_suites_run_after_own_tests() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("order.log");
        let append = |s: &str| make_case(&format!("echo {s} >> order.log"), dir.path());
        let suite = Suite {
            title: "Root".to_string(),
            tests: vec![make_test("parent", vec![append("parent")])],
            children: vec![make_suite(vec![make_test("child", vec![append("child")])])],
        };

        let result = run(config(&dir), &suite).await;
        assert_eq!(result.passed(), 2);
        assert_eq!(fs::read_to_string(log).unwrap(), "parent\nchild\n");
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn test_failure_skips_rest_of_test_only() {
        let dir = tempdir().unwrap();
        write_hook(dir.path(), "mark", "touch \"hook-$1\"\n");
        let mut skipped = make_case("touch never", dir.path());
        skipped.hook = Some("mark".to_string());
        let suite = make_suite(vec![
            make_test("broken", vec![make_case("false", dir.path()), skipped]),
            make_test("sibling", vec![make_case("touch sibling", dir.path())]),
        ]);

        let result = run(config(&dir), &suite).await;
        let broken = &result.root.tests[0];
        assert_eq!(broken.status, Status::Failed);
        let statuses: Vec<_> = broken.cases.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![Status::Failed, Status::Skipped]);
        let failure = broken.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::ExitStatus);
        assert_eq!(failure.code, Some(1));
        assert!(!dir.path().join("never").exists());
        assert!(!dir.path().join("hook-before").exists());
        assert!(!dir.path().join("hook-after").exists());

        assert_eq!(result.root.tests[1].status, Status::Passed);
        assert!(dir.path().join("sibling").exists());
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_stderr_fails_case() {
        let dir = tempdir().unwrap();
        let suite = make_suite(vec![make_test(
            "noisy",
            vec![make_case("echo warning >&2", dir.path())],
        )]);

        let result = run(config(&dir), &suite).await;
        let failure = result.root.tests[0].failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::ExitStatus);
        assert!(failure.output.contains("warning"));
    }

    #[tokio::test]
    async fn test_expect_error_passes() {
        let dir = tempdir().unwrap();
        let mut case = make_case("echo expected >&2; (exit 4)", dir.path());
        case.expect_error = true;
        let suite = make_suite(vec![make_test("expected", vec![case])]);

        let result = run(config(&dir), &suite).await;
        assert_eq!(result.root.tests[0].status, Status::Passed);
    }

    // ==================== Timeout Tests ====================

    #[tokio::test]
    async fn test_case_timeout_resets_shell() {
        let dir = tempdir().unwrap();
        let mut slow = make_case("sleep 5", dir.path());
        slow.timeout = 1;
        let suite = make_suite(vec![
            make_test("slow", vec![slow]),
            make_test("after", vec![make_case("echo alive", dir.path())]),
        ]);

        let start = Instant::now();
        let result = run(config(&dir), &suite).await;
        assert!(start.elapsed() < Duration::from_secs(4));

        let failure = result.root.tests[0].failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("timeout"));
        assert_eq!(result.root.tests[1].status, Status::Passed);
    }

    #[tokio::test]
    async fn test_whole_test_timeout() {
        let dir = tempdir().unwrap();
        let mut config = config(&dir);
        config.test_timeout = Duration::from_secs(1);
        let suite = make_suite(vec![make_test(
            "long",
            vec![
                make_case("sleep 0.2", dir.path()),
                make_case("sleep 5", dir.path()),
                make_case("true", dir.path()),
            ],
        )]);

        let result = run(config, &suite).await;
        let test = &result.root.tests[0];
        assert_eq!(test.failure.as_ref().unwrap().kind, FailureKind::Timeout);
        let statuses: Vec<_> = test.cases.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![Status::Passed, Status::Failed, Status::Skipped]);
    }

    // ==================== Hook Tests ====================

    fn write_hook(dir: &Path, name: &str, body: &str) {
        let tests_dir = dir.join("tests");
        fs::create_dir_all(&tests_dir).unwrap();
        fs::write(tests_dir.join(format!("hook-{name}.sh")), body).unwrap();
    }

    #[tokio::test]
    async fn test_hooks_wrap_command() {
        let dir = tempdir().unwrap();
        write_hook(dir.path(), "log", "echo \"$1\" >> hooks.log\n");
        let mut case = make_case("echo command >> hooks.log", dir.path());
        case.hook = Some("log".to_string());
        let suite = make_suite(vec![make_test("hooked", vec![case])]);

        let result = run(config(&dir), &suite).await;
        assert_eq!(result.passed(), 1);
        let log = fs::read_to_string(dir.path().join("hooks.log")).unwrap();
        assert_eq!(log, "before\ncommand\nafter\n");
    }

    #[tokio::test]
    async fn test_failing_before_hook_fails_case() {
        let dir = tempdir().unwrap();
        write_hook(dir.path(), "bad", "exit 3\n");
        let mut case = make_case("touch ran", dir.path());
        case.hook = Some("bad".to_string());
        let suite = make_suite(vec![make_test("hooked", vec![case])]);

        let result = run(config(&dir), &suite).await;
        let failure = result.root.tests[0].failure.as_ref().unwrap();
        assert_eq!(failure.code, Some(3));
        assert!(failure.message.contains("before hook"));
        assert!(!dir.path().join("ran").exists());
    }

    // ==================== Dry Run & Wait Tests ====================

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let dir = tempdir().unwrap();
        write_hook(dir.path(), "log", "touch hook-ran\n");
        let mut case = make_case("touch command-ran", dir.path());
        case.hook = Some("log".to_string());
        case.wait = 30;
        let suite = make_suite(vec![make_test("dry", vec![case])]);
        let mut config = config(&dir);
        config.dry_run = true;

        let start = Instant::now();
        let result = run(config, &suite).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.passed(), 1);
        assert!(!dir.path().join("command-ran").exists());
        assert!(!dir.path().join("hook-ran").exists());
    }

    #[tokio::test]
    async fn test_wait_pauses_after_success() {
        let dir = tempdir().unwrap();
        let mut case = make_case("true", dir.path());
        case.wait = 1;
        let suite = make_suite(vec![make_test("waits", vec![case])]);

        let start = Instant::now();
        let result = run(config(&dir), &suite).await;
        assert_eq!(result.passed(), 1);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    // ==================== Config Tests ====================

    #[test]
    fn test_suite_config_overrides_defaults() {
        let suite = SuiteConfig {
            glob: Some("a/*".to_string()),
            timeout: Some(30),
            case_timeout: Some(4),
            shell: Some("sh".to_string()),
            ..SuiteConfig::default()
        };
        let config = RunConfig::from_suite("content", Some(&suite)).unwrap();
        assert_eq!(config.test_timeout, Duration::from_secs(30));
        assert_eq!(config.default_case_timeout, 4);
        assert_eq!(config.hook_timeout, Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS));
        assert_eq!(config.shell, "sh");
        assert_eq!(config.language, "bash");
        assert!(config.glob.unwrap().matches("a/_index.md"));
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let mut config = RunConfig::new("content");
        let result = config.set_glob("[unclosed");
        assert!(matches!(result, Err(DiscoveryError::InvalidGlob { .. })));
        config.set_glob("").unwrap();
        assert!(config.glob.is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(Path::new("/a b/c")), "'/a b/c'");
        assert_eq!(shell_quote(Path::new("/it's")), r"'/it'\''s'");
    }
}
