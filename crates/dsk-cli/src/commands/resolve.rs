use super::{json_pretty, load_request, CliError, CmdResult, Session, EXIT_SUCCESS};
use dsk_core::{resolve, select_splat, SplatRegistry};
use dsk_schema::read_manifest_file;
use std::path::Path;

/// Show the splat that would be chosen and the resolved component set,
/// without building a plan.
pub fn run(session: &Session, manifest: &Path, request: &Path) -> CmdResult {
    let manifest = read_manifest_file(manifest).map_err(|e| CliError::status(&e))?;
    let request = load_request(request)?;

    let registry = SplatRegistry::builtin();
    let selection =
        select_splat(&registry, &manifest, &request).map_err(|e| CliError::status(&e))?;
    let resolved = resolve(&manifest, &request, &request.target_platform)
        .map_err(|e| CliError::status(&e))?;

    if session.json {
        let payload = serde_json::json!({
            "splat": selection,
            "resolved": resolved,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("splat: {} ({:?})", selection.selected.id, selection.reason);
    for r in &selection.rejections {
        println!("  rejected {}: {} ({})", r.splat_id, r.code.as_str(), r.detail);
    }
    println!("resolved set {}:", resolved.digest64);
    for c in &resolved.components {
        println!(
            "  {:<24} {:<10} {:<8} {}",
            c.id.as_str(),
            c.version,
            c.kind.as_str(),
            c.source
        );
    }
    Ok(EXIT_SUCCESS)
}
