use super::{json_pretty, CliError, CmdResult, Session, EXIT_SUCCESS};
use dsk_schema::{parse_manifest_source_str, write_manifest_file};
use std::path::{Path, PathBuf};

/// Compile a TOML manifest source into its canonical `.dsumanifest` form.
///
/// Artifacts that omit `digest`/`size` are measured from `payload_root`,
/// which defaults to the source file's directory.
pub fn compile(
    session: &Session,
    source: &Path,
    payload_root: Option<&Path>,
    out: Option<&Path>,
) -> CmdResult {
    let text = std::fs::read_to_string(source)
        .map_err(|e| format!("failed to read manifest source {}: {e}", source.display()))?;
    let payload_root = payload_root
        .map(Path::to_path_buf)
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_default();

    let manifest = parse_manifest_source_str(&text)
        .and_then(|src| src.compile(Some(&payload_root)))
        .map_err(|e| CliError::status(&e))?;

    let out: PathBuf = out.map_or_else(|| source.with_extension("dsumanifest"), Path::to_path_buf);
    write_manifest_file(&out, &manifest).map_err(|e| CliError::status(&e))?;
    tracing::info!("compiled {} -> {}", source.display(), out.display());

    if session.json {
        let payload = serde_json::json!({
            "path": out.display().to_string(),
            "product_id": manifest.product_id,
            "version": manifest.version,
            "components": manifest.components.len(),
            "digest64": manifest.digest().to_string(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "compiled {} {} ({} components) -> {}",
            manifest.product_id,
            manifest.version,
            manifest.components.len(),
            out.display()
        );
    }
    Ok(EXIT_SUCCESS)
}
