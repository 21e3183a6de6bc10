use super::{colorize_status, json_pretty, CliError, CmdResult, Session, EXIT_SUCCESS};
use dsk_schema::{parse_plan, write_plan};
use std::path::Path;

/// Parse a plan file, check its digest and every structural invariant, and
/// confirm that re-encoding it reproduces the same bytes.
pub fn run(session: &Session, plan: &Path) -> CmdResult {
    let bytes = std::fs::read(plan)
        .map_err(|e| CliError::from(format!("failed to read {}: {e}", plan.display())))?;
    let parsed = parse_plan(&bytes).map_err(|e| CliError::status(&e))?;
    let canonical = write_plan(&parsed) == bytes;

    if session.json {
        let payload = serde_json::json!({
            "path": plan.display().to_string(),
            "valid": true,
            "canonical": canonical,
            "plan_digest64": parsed.plan_digest64.to_string(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{} {} (plan {}{})",
            colorize_status("ok"),
            plan.display(),
            parsed.plan_digest64,
            if canonical { "" } else { ", non-canonical encoding" }
        );
    }
    Ok(EXIT_SUCCESS)
}
