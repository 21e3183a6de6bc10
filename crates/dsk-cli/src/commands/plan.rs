use super::{
    json_pretty, load_request, spin_fail, spin_ok, CliError, CmdResult, Session, EXIT_SUCCESS,
};
use dsk_core::{build_plan, SplatRegistry};
use dsk_schema::{read_manifest_file, write_plan_file, FileOpKind};
use dsk_store::InstalledState;
use std::path::Path;

/// Build a plan from a compiled manifest and a request and write it to `out`.
/// The product's current installed state, if any, feeds upgrades, repairs
/// and uninstalls.
pub fn run(session: &Session, manifest: &Path, request: &Path, out: &Path) -> CmdResult {
    let manifest = read_manifest_file(manifest).map_err(|e| CliError::status(&e))?;
    let request = load_request(request)?;

    let state_path = session
        .layout(request.install_scope, &manifest.product_id)
        .state_path();
    let previous =
        InstalledState::load(&session.fs, &state_path).map_err(|e| CliError::status(&e))?;

    let pb = session.spinner("planning...");
    let result = build_plan(&manifest, &request, &SplatRegistry::builtin(), previous.as_ref());
    let outcome = match result {
        Ok(o) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "plan built");
            }
            o
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "planning refused");
            }
            return Err(CliError::status(&e));
        }
    };
    let plan = outcome.plan;
    write_plan_file(out, &plan).map_err(|e| CliError::status(&e))?;

    let copies = plan
        .file_ops
        .iter()
        .filter(|op| op.kind == FileOpKind::Copy)
        .count();
    let removals = plan.file_ops.len() - copies;
    if session.json {
        let payload = serde_json::json!({
            "path": out.display().to_string(),
            "plan_digest64": plan.plan_digest64.to_string(),
            "splat": plan.selected_splat,
            "operation": plan.operation,
            "steps": plan.ordered_steps.len(),
            "copies": copies,
            "removals": removals,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{} {} {} via {}: {} steps, {copies} copies, {removals} removals",
            plan.operation,
            plan.product_id,
            plan.product_version,
            plan.selected_splat,
            plan.ordered_steps.len()
        );
        println!("plan {} -> {}", plan.plan_digest64, out.display());
    }
    Ok(EXIT_SUCCESS)
}
