//! Code and test runners exposed as tools.
//!
//! Four operations map a project-relative path (and optionally a test name)
//! onto a shell command, detecting the test framework where it matters, and
//! run it through a [`SandboxExecutor`]. Each operation is also callable by
//! name with JSON arguments, for agents that drive the sandbox over a tool
//! protocol.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::classifier::{self, TestType};
use crate::config::SandboxConfig;
use crate::sandbox::command::shell_quote;
use crate::sandbox::{ExecutionResult, SandboxExecutor};

/// Errors from calling a tool by name.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// One front-end operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Run a Python file directly.
    RunCode { path: String },
    /// Run every test under a folder.
    RunTests { path: String },
    /// Run every test in one file.
    RunTestFile { path: String },
    /// Run one named test in one file.
    RunSingleTest { path: String, test_name: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCode { .. } => "run_code",
            Self::RunTests { .. } => "run_tests",
            Self::RunTestFile { .. } => "run_test_file",
            Self::RunSingleTest { .. } => "run_single_test",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::RunCode { path }
            | Self::RunTests { path }
            | Self::RunTestFile { path }
            | Self::RunSingleTest { path, .. } => path,
        }
    }

    /// Whether the command depends on the detected test framework.
    pub fn needs_classification(&self) -> bool {
        !matches!(self, Self::RunCode { .. })
    }

    /// Shell command for this operation, or `None` when the framework is
    /// unknown.
    pub fn command(&self, test_type: TestType) -> Option<String> {
        let path = shell_quote(self.path());
        match (self, test_type) {
            (Self::RunCode { .. }, _) => Some(format!("python {}", path)),
            (_, TestType::Unknown) => None,
            (Self::RunTests { .. } | Self::RunTestFile { .. }, TestType::Pytest) => {
                Some(format!("pytest {}", path))
            }
            (Self::RunTests { .. }, TestType::Unittest) => {
                Some(format!("python -m unittest discover -s {}", path))
            }
            (Self::RunTestFile { .. }, TestType::Unittest) => {
                Some(format!("python -m unittest {}", path))
            }
            (Self::RunSingleTest { path, test_name }, TestType::Pytest) => Some(format!(
                "pytest {}",
                shell_quote(&format!("{}::{}", path, test_name))
            )),
            (Self::RunSingleTest { path, test_name }, TestType::Unittest) => Some(format!(
                "python -m unittest {}",
                shell_quote(&format!("{}.{}", dotted_module(path), test_name))
            )),
        }
    }

    /// Parse a by-name call.
    pub fn from_call(name: &str, params: &serde_json::Value) -> Result<Self, ToolError> {
        let path = || required_str(params, "path");
        match name {
            "run_code" => Ok(Self::RunCode { path: path()? }),
            "run_tests" => Ok(Self::RunTests { path: path()? }),
            "run_test_file" => Ok(Self::RunTestFile { path: path()? }),
            "run_single_test" => Ok(Self::RunSingleTest {
                path: path()?,
                test_name: required_str(params, "test_name")?,
            }),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn required_str(params: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", key)))
}

/// `tests/test_math.py` -> `tests.test_math`.
fn dotted_module(path: &str) -> String {
    let trimmed = path.strip_suffix(".py").unwrap_or(path);
    Path::new(trimmed)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Name, description and JSON parameter schema of a tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// Definitions of every operation, in a stable order.
pub fn definitions() -> Vec<ToolDefinition> {
    let path_only = |description: &str| {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": description }
            },
            "required": ["path"]
        })
    };
    vec![
        ToolDefinition {
            name: "run_code",
            description: "Run a Python file in an isolated container and return its output.",
            parameters: path_only("Project-relative path of the Python file"),
        },
        ToolDefinition {
            name: "run_tests",
            description: "Run every test in a folder, detecting pytest or unittest.",
            parameters: path_only("Project-relative path of the test folder"),
        },
        ToolDefinition {
            name: "run_test_file",
            description: "Run every test in one file, detecting pytest or unittest.",
            parameters: path_only("Project-relative path of the test file"),
        },
        ToolDefinition {
            name: "run_single_test",
            description: "Run one named test from a file, detecting pytest or unittest.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Project-relative path of the test file"
                    },
                    "test_name": {
                        "type": "string",
                        "description": "Test id, e.g. test_add or TestMath.test_add"
                    }
                },
                "required": ["path", "test_name"]
            }),
        },
    ]
}

/// What an operation produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResponse {
    /// No test framework could be detected; nothing was run.
    Undetected { path: String },
    /// The command ran (or failed to start) in the sandbox.
    Executed {
        command: String,
        result: ExecutionResult,
    },
}

impl std::fmt::Display for ToolResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undetected { path } => {
                write!(f, "Unable to detect test framework in {}", path)
            }
            Self::Executed { result, .. } => write!(f, "{}", result),
        }
    }
}

/// Whether `test_type`'s runner is absent from a bare base image that this
/// config will not install anything into.
pub fn runner_may_be_missing(test_type: TestType, config: &SandboxConfig) -> bool {
    test_type == TestType::Pytest && !config.install_dependencies
}

/// Runs the four operations against one project.
pub struct SandboxTools {
    executor: Arc<SandboxExecutor>,
    project_root: PathBuf,
    config: SandboxConfig,
}

impl SandboxTools {
    pub fn new(
        executor: Arc<SandboxExecutor>,
        project_root: impl Into<PathBuf>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            executor,
            project_root: project_root.into(),
            config,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub async fn run_code(&self, path: &str) -> String {
        self.dispatch(Operation::RunCode { path: path.to_string() })
            .await
            .to_string()
    }

    pub async fn run_tests(&self, path: &str) -> String {
        self.dispatch(Operation::RunTests { path: path.to_string() })
            .await
            .to_string()
    }

    pub async fn run_test_file(&self, path: &str) -> String {
        self.dispatch(Operation::RunTestFile { path: path.to_string() })
            .await
            .to_string()
    }

    pub async fn run_single_test(&self, path: &str, test_name: &str) -> String {
        self.dispatch(Operation::RunSingleTest {
            path: path.to_string(),
            test_name: test_name.to_string(),
        })
        .await
        .to_string()
    }

    /// Run a tool by name with JSON arguments.
    pub async fn call(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<ToolResponse, ToolError> {
        let op = Operation::from_call(name, params)?;
        Ok(self.dispatch(op).await)
    }

    /// Classify (when needed), build the command and execute it.
    pub async fn dispatch(&self, op: Operation) -> ToolResponse {
        let op = self.relativize(op);
        let test_type = if op.needs_classification() {
            let target = self.project_root.join(op.path());
            tokio::task::spawn_blocking(move || classifier::classify(&target))
                .await
                .unwrap_or(TestType::Unknown)
        } else {
            TestType::Unknown
        };

        let Some(command) = op.command(test_type) else {
            tracing::info!(tool = op.name(), path = op.path(), "No test framework detected");
            return ToolResponse::Undetected {
                path: op.path().to_string(),
            };
        };

        if runner_may_be_missing(test_type, &self.config) {
            tracing::warn!(
                tool = op.name(),
                profile = %self.config.profile,
                "pytest is not installed in the base image and this profile installs nothing; \
                 use the networked-dependency-install profile"
            );
        }

        tracing::info!(tool = op.name(), command = %command, "Dispatching to sandbox");
        let result = self
            .executor
            .execute(&self.project_root, &command, &self.config)
            .await;
        ToolResponse::Executed { command, result }
    }

    /// Absolute paths under the project root become project-relative, since
    /// the container only sees the project at its working directory.
    fn relativize(&self, op: Operation) -> Operation {
        let fix = |path: String| match Path::new(&path).strip_prefix(&self.project_root) {
            Ok(rel) if Path::new(&path).is_absolute() => {
                let rel = rel.to_string_lossy().to_string();
                if rel.is_empty() { ".".to_string() } else { rel }
            }
            _ => path,
        };
        match op {
            Operation::RunCode { path } => Operation::RunCode { path: fix(path) },
            Operation::RunTests { path } => Operation::RunTests { path: fix(path) },
            Operation::RunTestFile { path } => Operation::RunTestFile { path: fix(path) },
            Operation::RunSingleTest { path, test_name } => Operation::RunSingleTest {
                path: fix(path),
                test_name,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::sandbox::WorkspaceStager;
    use crate::sandbox::testing::MockRuntime;

    const IMAGE: &str = "python:3.11-slim";

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("example.py"), "print('hello')\n").unwrap();
        fs::create_dir_all(root.join("tests")).unwrap();
        fs::write(
            root.join("tests").join("test_math.py"),
            "import pytest\n\ndef test_add():\n    assert 1 + 1 == 2\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("legacy")).unwrap();
        fs::write(
            root.join("legacy").join("test_old.py"),
            "import unittest\n\nclass TestOld(unittest.TestCase):\n    pass\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("docs").join("notes.py"), "X = 1\n").unwrap();
        dir
    }

    fn tools(project: &Path, base: &Path) -> (Arc<MockRuntime>, SandboxTools) {
        let runtime = Arc::new(MockRuntime::new().with_image(IMAGE).with_result(0, "ok"));
        let executor = SandboxExecutor::new(runtime.clone())
            .with_stager(WorkspaceStager::with_base_dir(base));
        let tools = SandboxTools::new(Arc::new(executor), project, SandboxConfig::default());
        (runtime, tools)
    }

    fn op_path(path: &str) -> [Operation; 3] {
        [
            Operation::RunTests { path: path.into() },
            Operation::RunTestFile { path: path.into() },
            Operation::RunSingleTest {
                path: path.into(),
                test_name: "test_add".into(),
            },
        ]
    }

    #[test]
    fn test_pytest_runner_warning_depends_on_profile() {
        use crate::config::Profile;

        let isolated = SandboxConfig::for_profile(Profile::IsolatedReadonly);
        let networked = SandboxConfig::for_profile(Profile::NetworkedDependencyInstall);
        assert!(runner_may_be_missing(TestType::Pytest, &isolated));
        assert!(!runner_may_be_missing(TestType::Pytest, &networked));
        assert!(!runner_may_be_missing(TestType::Unittest, &isolated));
        assert!(!runner_may_be_missing(TestType::Unknown, &isolated));
    }

    #[test]
    fn test_pytest_commands() {
        let [tests, file, single] = op_path("tests/test_math.py");
        assert_eq!(tests.command(TestType::Pytest).unwrap(), "pytest tests/test_math.py");
        assert_eq!(file.command(TestType::Pytest).unwrap(), "pytest tests/test_math.py");
        assert_eq!(
            single.command(TestType::Pytest).unwrap(),
            "pytest tests/test_math.py::test_add"
        );
    }

    #[test]
    fn test_unittest_commands() {
        let [tests, file, single] = op_path("legacy/test_old.py");
        assert_eq!(
            tests.command(TestType::Unittest).unwrap(),
            "python -m unittest discover -s legacy/test_old.py"
        );
        assert_eq!(
            file.command(TestType::Unittest).unwrap(),
            "python -m unittest legacy/test_old.py"
        );
        assert_eq!(
            single.command(TestType::Unittest).unwrap(),
            "python -m unittest legacy.test_old.test_add"
        );
    }

    #[test]
    fn test_unknown_framework_has_no_command() {
        for op in op_path("docs") {
            assert!(op.command(TestType::Unknown).is_none());
        }
        let run = Operation::RunCode {
            path: "example.py".into(),
        };
        assert_eq!(run.command(TestType::Unknown).unwrap(), "python example.py");
    }

    #[test]
    fn test_paths_are_quoted() {
        let op = Operation::RunCode {
            path: "my scripts/run.py".into(),
        };
        assert_eq!(op.command(TestType::Unknown).unwrap(), "python 'my scripts/run.py'");
    }

    #[test]
    fn test_dotted_module() {
        assert_eq!(dotted_module("tests/test_math.py"), "tests.test_math");
        assert_eq!(dotted_module("./test_math.py"), "test_math");
        assert_eq!(dotted_module("pkg/sub/mod"), "pkg.sub.mod");
    }

    #[test]
    fn test_from_call() {
        let op = Operation::from_call(
            "run_single_test",
            &serde_json::json!({"path": "tests/test_math.py", "test_name": "test_add"}),
        )
        .unwrap();
        assert_eq!(op.name(), "run_single_test");

        let err = Operation::from_call("run_tests", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let err = Operation::from_call("rm_rf", &serde_json::json!({"path": "/"})).unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[test]
    fn test_definitions_cover_every_operation() {
        let names: Vec<&str> = definitions().iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["run_code", "run_tests", "run_test_file", "run_single_test"]);
        let single = &definitions()[3];
        let required = single.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[tokio::test]
    async fn test_run_code_skips_classification() {
        let project = project();
        let base = TempDir::new().unwrap();
        let (runtime, tools) = tools(project.path(), base.path());

        let out = tools.run_code("example.py").await;

        assert_eq!(out, "Exit Code: 0\n\nOUTPUT:\nok");
        assert_eq!(runtime.last_spec().cmd.last().unwrap(), "python example.py");
    }

    #[tokio::test]
    async fn test_run_single_test_pytest() {
        let project = project();
        let base = TempDir::new().unwrap();
        let (runtime, tools) = tools(project.path(), base.path());

        tools.run_single_test("tests/test_math.py", "test_add").await;

        assert_eq!(
            runtime.last_spec().cmd.last().unwrap(),
            "pytest tests/test_math.py::test_add"
        );
    }

    #[tokio::test]
    async fn test_run_tests_unittest_folder() {
        let project = project();
        let base = TempDir::new().unwrap();
        let (runtime, tools) = tools(project.path(), base.path());

        tools.run_tests("legacy").await;

        assert_eq!(
            runtime.last_spec().cmd.last().unwrap(),
            "python -m unittest discover -s legacy"
        );
    }

    #[tokio::test]
    async fn test_undetected_framework_never_reaches_executor() {
        let project = project();
        let base = TempDir::new().unwrap();
        let (runtime, tools) = tools(project.path(), base.path());

        let out = tools.run_tests("docs").await;

        assert_eq!(out, "Unable to detect test framework in docs");
        assert!(runtime.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_absolute_path_is_made_relative() {
        let project = project();
        let base = TempDir::new().unwrap();
        let (runtime, tools) = tools(project.path(), base.path());
        let absolute = project.path().join("tests").join("test_math.py");

        tools.run_test_file(absolute.to_str().unwrap()).await;

        assert_eq!(
            runtime.last_spec().cmd.last().unwrap(),
            "pytest tests/test_math.py"
        );
    }

    #[tokio::test]
    async fn test_call_by_name_returns_structured_response() {
        let project = project();
        let base = TempDir::new().unwrap();
        let (_runtime, tools) = tools(project.path(), base.path());

        let response = tools
            .call("run_test_file", &serde_json::json!({"path": "tests/test_math.py"}))
            .await
            .unwrap();

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "executed");
        assert_eq!(json["command"], "pytest tests/test_math.py");
        assert_eq!(json["result"]["exit_code"], 0);
    }
}
