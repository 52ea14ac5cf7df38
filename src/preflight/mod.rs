//! Host tool checks.
//!
//! The checkout shells out to `git`, builds to `make` and `docker`. Missing
//! tools are reported up front instead of as a pile of spawn failures.
//!
//! # Example
//!
//! ```rust
//! use refplat_builder::preflight::{check_required_tools, command_exists, HostTool};
//!
//! if !command_exists("docker") {
//!     println!("docker not installed");
//! }
//!
//! if let Err(e) = check_required_tools(&[HostTool::new("git", "git")]) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// A program looked up on `PATH`, with the package that provides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTool<'a> {
    pub command: &'a str,
    pub package: &'a str,
}

impl<'a> HostTool<'a> {
    pub const fn new(command: &'a str, package: &'a str) -> Self {
        Self { command, package }
    }
}

pub const GIT: HostTool<'static> = HostTool::new("git", "git");

/// Needed by `make docker-image` besides the build program itself.
pub const DOCKER: HostTool<'static> = HostTool::new("docker", "docker.io or docker-ce");

pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Fail listing every tool in `tools` that is not on `PATH`.
pub fn check_required_tools(tools: &[HostTool<'_>]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|tool| !command_exists(tool.command))
        .map(|tool| format!("  {} (install: {})", tool.command, tool.package))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }
    bail!("Missing required host tools:\n{}", missing.join("\n"))
}

/// Check the build command's program and docker.
pub fn check_build_tools(command: &[String]) -> Result<()> {
    let mut tools = Vec::with_capacity(2);
    if let Some(program) = command.first() {
        tools.push(HostTool::new(program, program));
    }
    tools.push(DOCKER);
    check_required_tools(&tools)
}
