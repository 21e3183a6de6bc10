use super::{json_pretty, CliError, CmdResult, EXIT_INVALID, EXIT_SUCCESS};
use dsk_schema::manifest::MANIFEST_MAGIC;
use dsk_schema::plan::PLAN_MAGIC;
use dsk_schema::request::REQUEST_MAGIC;
use dsk_schema::{parse_manifest, parse_plan, parse_request};
use dsk_store::audit::AUDIT_MAGIC;
use dsk_store::journal::JOURNAL_MAGIC;
use dsk_store::registry::REGISTRATIONS_MAGIC;
use dsk_store::state::STATE_MAGIC;
use dsk_store::txn::TXN_MAGIC;
use dsk_store::{AuditLog, InstalledState, JobJournal, RegistrationRecord, TxnJournal};
use std::path::Path;

fn to_json<T: serde::Serialize, E: dsk_schema::HasStatus + std::fmt::Display>(
    parsed: Result<T, E>,
) -> Result<String, CliError> {
    let value = parsed.map_err(|e| CliError::status(&e))?;
    Ok(json_pretty(&value)?)
}

/// Print any dsk record file as pretty JSON, picking the decoder from the
/// file's magic. Output is deterministic for identical input bytes.
pub fn run(path: &Path) -> CmdResult {
    let bytes = std::fs::read(path)
        .map_err(|e| CliError::from(format!("failed to read {}: {e}", path.display())))?;
    let Some(magic) = bytes.get(..4) else {
        return Err(CliError {
            code: EXIT_INVALID,
            message: format!("{}: file too short to be a dsk record", path.display()),
        });
    };

    let json = match magic {
        m if m == MANIFEST_MAGIC => to_json(parse_manifest(&bytes))?,
        m if m == REQUEST_MAGIC => to_json(parse_request(&bytes))?,
        m if m == PLAN_MAGIC => to_json(parse_plan(&bytes))?,
        m if m == STATE_MAGIC => to_json(InstalledState::parse(&bytes))?,
        m if m == TXN_MAGIC => to_json(TxnJournal::parse(&bytes))?,
        m if m == AUDIT_MAGIC => to_json(AuditLog::parse(&bytes))?,
        m if m == REGISTRATIONS_MAGIC => to_json(RegistrationRecord::parse(&bytes))?,
        m if m == JOURNAL_MAGIC => {
            let journal = JobJournal::parse(&bytes).map_err(|e| CliError::status(&e))?;
            let payload = serde_json::json!({
                "status": journal.status(),
                "journal": journal,
            });
            json_pretty(&payload)?
        }
        other => {
            return Err(CliError {
                code: EXIT_INVALID,
                message: format!(
                    "{}: unknown record magic {:?}",
                    path.display(),
                    String::from_utf8_lossy(other)
                ),
            });
        }
    };
    println!("{json}");
    Ok(EXIT_SUCCESS)
}
