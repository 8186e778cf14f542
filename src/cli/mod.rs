//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running a Python file (`run`)
//! - Running tests by folder, file or name (`test`, `test-file`, `test-one`)
//! - Inspecting a project (`classify`, `deps`)
//! - Driving the tools by name (`tools`, `call`)
//! - Checking the host setup (`doctor`)

mod doctor;

pub use doctor::run_doctor_command;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::classifier;
use crate::config::{Profile, SandboxConfig};
use crate::deps;
use crate::sandbox::{DockerRuntime, SandboxExecutor};
use crate::tools::{self, Operation, SandboxTools, ToolResponse};

#[derive(Parser, Debug)]
#[command(name = "pybox")]
#[command(about = "Run Python code and test suites in short-lived Docker sandboxes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project root that paths are relative to
    #[arg(short, long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Sandbox profile (isolated-readonly, networked-dependency-install).
    ///
    /// The default isolated-readonly profile installs nothing, and the base
    /// image has no pytest; use networked-dependency-install for pytest runs.
    #[arg(long, global = true)]
    pub profile: Option<Profile>,

    /// Deadline in seconds for the whole command
    #[arg(short, long, global = true)]
    pub timeout: Option<u64>,

    /// Python version used to pick the base image (e.g. 3.12)
    #[arg(long, global = true)]
    pub python_version: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a Python file
    Run {
        /// Project-relative path of the file
        path: String,
    },

    /// Run every test under a folder
    Test {
        /// Project-relative folder
        #[arg(default_value = ".")]
        path: String,
    },

    /// Run every test in one file
    TestFile {
        /// Project-relative path of the test file
        path: String,
    },

    /// Run a single named test
    TestOne {
        /// Project-relative path of the test file
        path: String,

        /// Test id (e.g. test_add or TestMath.test_add)
        test_name: String,
    },

    /// Print the detected test framework
    Classify {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Print the project's installed packages
    Deps,

    /// Print the tool definitions as JSON
    Tools,

    /// Call a tool by name with JSON arguments
    Call {
        /// Tool name (run_code, run_tests, run_test_file, run_single_test)
        name: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Check Docker, the base image and the project environment
    Doctor,
}

impl Cli {
    /// `PYBOX_*` overrides given on the command line.
    pub fn overrides(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        if let Some(profile) = self.profile {
            map.insert("PYBOX_PROFILE", profile.to_string());
        }
        if let Some(secs) = self.timeout {
            map.insert("PYBOX_TIMEOUT_SECS", secs.to_string());
        }
        if let Some(ref version) = self.python_version {
            map.insert("PYBOX_PYTHON_VERSION", version.clone());
        }
        map
    }

    /// Resolve the sandbox configuration: CLI options, then the
    /// environment (and `.env`), then profile defaults.
    pub fn sandbox_config(&self) -> anyhow::Result<SandboxConfig> {
        let _ = dotenvy::dotenv();
        let overrides = self.overrides();
        let config = SandboxConfig::from_lookup(|key| {
            overrides
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        })?;
        Ok(config)
    }

    fn operation(&self) -> Option<Operation> {
        match &self.command {
            Command::Run { path } => Some(Operation::RunCode { path: path.clone() }),
            Command::Test { path } => Some(Operation::RunTests { path: path.clone() }),
            Command::TestFile { path } => Some(Operation::RunTestFile { path: path.clone() }),
            Command::TestOne { path, test_name } => Some(Operation::RunSingleTest {
                path: path.clone(),
                test_name: test_name.clone(),
            }),
            _ => None,
        }
    }
}

/// Process exit status for a tool response: the sandbox exit code when it
/// fits in a byte, 1 for other failures, 2 when nothing ran.
pub fn exit_status(response: &ToolResponse) -> u8 {
    match response {
        ToolResponse::Undetected { .. } => 2,
        ToolResponse::Executed { result, .. } => match result.exit_code {
            Some(0) => 0,
            Some(code) => u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1),
            None => 2,
        },
    }
}

fn exit_code(response: &ToolResponse) -> ExitCode {
    ExitCode::from(exit_status(response))
}

fn print_response(response: &ToolResponse, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        println!("{}", response);
    }
    Ok(())
}

async fn connect_tools(cli: &Cli) -> anyhow::Result<SandboxTools> {
    let config = cli.sandbox_config()?;
    let runtime = DockerRuntime::connect()
        .await
        .context("Docker is required to run sandboxed commands")?;
    let executor = SandboxExecutor::new(Arc::new(runtime));
    Ok(SandboxTools::new(Arc::new(executor), &cli.project, config))
}

/// Execute the parsed command.
pub async fn run_command(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Some(op) = cli.operation() {
        let tools = connect_tools(&cli).await?;
        let response = tools.dispatch(op).await;
        print_response(&response, cli.json)?;
        return Ok(exit_code(&response));
    }

    match &cli.command {
        Command::Classify { path } => {
            let target = cli.project.join(path);
            let test_type = classifier::classify(&target);
            if cli.json {
                println!("{}", serde_json::json!({ "path": target, "test_type": test_type }));
            } else {
                println!("{}", test_type);
            }
        }
        Command::Deps => {
            let packages = deps::snapshot(&cli.project).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&packages)?);
            } else {
                for package in &packages {
                    println!("{}", package);
                }
            }
        }
        Command::Tools => {
            println!("{}", serde_json::to_string_pretty(&tools::definitions())?);
        }
        Command::Call { name, params } => {
            let params: serde_json::Value =
                serde_json::from_str(params).context("arguments must be a JSON object")?;
            let tools = connect_tools(&cli).await?;
            let response = tools.call(name, &params).await?;
            print_response(&response, cli.json)?;
            return Ok(exit_code(&response));
        }
        Command::Doctor => {
            let config = cli.sandbox_config()?;
            return run_doctor_command(&cli.project, &config).await;
        }
        Command::Run { .. }
        | Command::Test { .. }
        | Command::TestFile { .. }
        | Command::TestOne { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}
