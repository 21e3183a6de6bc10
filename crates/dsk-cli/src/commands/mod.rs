pub mod apply;
pub mod completions;
pub mod dump;
pub mod man_pages;
pub mod manifest;
pub mod plan;
pub mod request;
pub mod resolve;
pub mod validate;
pub mod verify;

use crate::config::DskConfig;
use dsk_schema::{
    parse_request_source_str, read_plan_file, read_request_file, HasStatus, InstallScope, Plan,
    Request, StatusCode,
};
use dsk_store::{FileSystem, RealFs, StateLayout};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INVALID: u8 = 2;
pub const EXIT_REFUSED: u8 = 3;
pub const EXIT_INTEGRITY: u8 = 4;
pub const EXIT_IO: u8 = 5;

/// A failed command: the message printed after `error:` and the exit code.
#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
}

impl CliError {
    pub fn status<E: HasStatus + fmt::Display>(err: &E) -> Self {
        Self {
            code: exit_code(err.status().code),
            message: err.to_string(),
        }
    }
}

impl From<String> for CliError {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type CmdResult = Result<u8, CliError>;

pub fn exit_code(code: StatusCode) -> u8 {
    match code {
        StatusCode::Ok => EXIT_SUCCESS,
        StatusCode::ParseError | StatusCode::ValidationError => EXIT_INVALID,
        StatusCode::RefusalError => EXIT_REFUSED,
        StatusCode::IntegrityError => EXIT_INTEGRITY,
        StatusCode::IoError => EXIT_IO,
        StatusCode::Interrupted => EXIT_FAILURE,
    }
}

/// Everything a command needs besides its own arguments.
pub struct Session {
    pub fs: RealFs,
    pub config: DskConfig,
    pub json: bool,
}

impl Session {
    pub fn new(config: DskConfig, sandbox: Option<PathBuf>, json: bool) -> Result<Self, String> {
        let fs = match sandbox.or_else(|| config.sandbox.clone()) {
            Some(root) => RealFs::sandboxed(root),
            None => {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .ok_or_else(|| "HOME is not set; pass --sandbox".to_owned())?;
                let portable = match &config.portable_dir {
                    Some(dir) => dir.clone(),
                    None => std::env::current_dir()
                        .map_err(|e| format!("cannot determine current directory: {e}"))?
                        .join("portable"),
                };
                RealFs::host(&home, &portable)
            }
        };
        Ok(Self { fs, config, json })
    }

    pub fn layout(&self, scope: InstallScope, product_id: &str) -> StateLayout {
        StateLayout::new(&self.fs.scope_paths(scope), product_id)
    }

    /// The spinner, unless output is JSON.
    pub fn spinner(&self, msg: &str) -> Option<ProgressBar> {
        if self.json {
            None
        } else {
            Some(spinner(msg))
        }
    }
}

/// Read a compiled request, or a TOML request source when the file ends in
/// `.toml`.
pub fn load_request(path: &Path) -> Result<Request, CliError> {
    if path.extension().is_some_and(|e| e == "toml") {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CliError::from(format!("failed to read {}: {e}", path.display())))?;
        parse_request_source_str(&text).map_err(|e| CliError::status(&e))
    } else {
        read_request_file(path).map_err(|e| CliError::status(&e))
    }
}

pub fn load_plan(path: &Path) -> Result<Plan, CliError> {
    read_plan_file(path).map_err(|e| CliError::status(&e))
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(
        style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "completed" | "applied" | "ok" => Style::new().green().apply_to(status).to_string(),
        "in_progress" | "interrupted" => Style::new().yellow().apply_to(status).to_string(),
        "failed" | "FAIL" => Style::new().red().bold().apply_to(status).to_string(),
        "rolled_back" | "dry_run" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}
