use super::{
    colorize_status, json_pretty, CliError, CmdResult, Session, EXIT_INTEGRITY, EXIT_SUCCESS,
};
use dsk_schema::InstallScope;
use dsk_store::{verify_installed, FileSystem, InstalledState};

/// Re-digest every installed file of `product_id` against its installed
/// state.
pub fn run(session: &Session, product_id: &str, scope: InstallScope) -> CmdResult {
    let state_path = session.layout(scope, product_id).state_path();
    let state = InstalledState::load(&session.fs, &state_path)
        .map_err(|e| CliError::status(&e))?
        .ok_or_else(|| format!("'{product_id}' is not installed in {scope} scope"))?;
    let install_base = session.fs.scope_paths(scope).install_base;
    let report =
        verify_installed(&session.fs, &install_base, &state).map_err(|e| CliError::status(&e))?;

    if session.json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "{} {}: {}/{} files passed",
            state.product_id, state.product_version, report.passed, report.checked
        );
        for f in &report.failed {
            println!("  {} {}/{}: {}", colorize_status("FAIL"), f.root, f.path, f.reason);
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_INTEGRITY)
    }
}
