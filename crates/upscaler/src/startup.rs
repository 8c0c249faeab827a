//! Preflight checks run before the worker starts taking tasks
//!
//! Every external program the pipeline spawns must be runnable, and the
//! frame generator's filter script must exist. Checks run in pipeline order
//! and stop at the first failure.

use crate::config::{Config, ToolsConfig};
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{program} is not available: {detail}")]
    ToolUnavailable { program: String, detail: String },

    #[error("Filter script {0} does not exist")]
    ScriptMissing(PathBuf),
}

/// Run `program version_arg` and return the first line it printed.
///
/// Some tools print their version on stderr, so stdout falls back to stderr.
pub fn check_tool(program: &str, version_arg: &str) -> Result<String, StartupError> {
    let output = Command::new(program)
        .arg(version_arg)
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            program: program.to_string(),
            detail: format!(
                "{} {} failed; is it installed and in PATH? Error: {}",
                program, version_arg, e
            ),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            program: program.to_string(),
            detail: format!("{} {} exited with {}", program, version_arg, output.status),
        });
    }

    Ok(first_line(&output.stdout)
        .or_else(|| first_line(&output.stderr))
        .unwrap_or_else(|| "(no version output)".to_string()))
}

fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Verify the frame generator's script is present.
pub fn check_script(tools: &ToolsConfig) -> Result<(), StartupError> {
    if tools.script.is_file() {
        Ok(())
    } else {
        Err(StartupError::ScriptMissing(tools.script.clone()))
    }
}

/// Run all startup checks in order
///
/// 1. Probe (`ffprobe -version`)
/// 2. Frame generator (`vspipe --version`) and its script
/// 3. Encoder (`ffmpeg -version`)
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let tools = &cfg.tools;

    let version = check_tool(&tools.ffprobe, "-version")?;
    info!(program = %tools.ffprobe, %version, "Probe available");

    let version = check_tool(&tools.vspipe, "--version")?;
    info!(program = %tools.vspipe, %version, "Frame generator available");
    check_script(tools)?;

    let version = check_tool(&tools.ffmpeg, "-version")?;
    info!(program = %tools.ffmpeg, %version, "Encoder available");

    Ok(())
}
