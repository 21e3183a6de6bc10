use super::{json_pretty, load_request, CliError, CmdResult, Session, EXIT_SUCCESS};
use dsk_schema::{
    write_request_file, CapBits, InstallScope, Operation, Ownership, PolicyFlags, Request,
    RequestBuilder, UiMode,
};
use std::path::{Path, PathBuf};

/// Request fields as given on the command line.
#[derive(Debug, Default)]
pub struct RequestArgs {
    pub from: Option<PathBuf>,
    pub operation: Option<Operation>,
    pub scope: Option<InstallScope>,
    pub platform: Option<String>,
    pub components: Vec<String>,
    pub exclude: Vec<String>,
    pub payload_root: Option<String>,
    pub splat: Option<String>,
    pub ownership: Option<Ownership>,
    pub policy: Vec<String>,
    pub require_caps: Vec<String>,
    pub prohibit_caps: Vec<String>,
}

fn build(session: &Session, args: RequestArgs) -> Result<Request, CliError> {
    if let Some(from) = &args.from {
        return load_request(from);
    }
    let platform = args
        .platform
        .or_else(|| session.config.default_platform.clone())
        .ok_or_else(|| "no --platform given and no default_platform configured".to_owned())?;
    let policy = PolicyFlags::from_names(args.policy.as_slice())?;
    let mut builder = RequestBuilder::new(
        args.operation.unwrap_or(Operation::Install),
        args.scope.unwrap_or(InstallScope::User),
        platform,
    )
    .policy(policy)
    .ui_mode(UiMode::Cli)
    .ownership(args.ownership.unwrap_or(Ownership::Any))
    .require_caps(CapBits::from_names(args.require_caps.as_slice())?)
    .prohibit_caps(CapBits::from_names(args.prohibit_caps.as_slice())?)
    .frontend("dsk-cli");
    if let Some(root) = args.payload_root {
        builder = builder.payload_root(root);
    }
    if let Some(splat) = args.splat {
        builder = builder.splat(splat);
    }
    for c in args.components {
        builder = builder.request(c);
    }
    for c in args.exclude {
        builder = builder.exclude(c);
    }
    builder.build().map_err(|e| CliError::status(&e))
}

pub fn run(session: &Session, args: RequestArgs, out: &Path) -> CmdResult {
    let request = build(session, args)?;
    write_request_file(out, &request).map_err(|e| CliError::status(&e))?;

    if session.json {
        let payload = serde_json::json!({
            "path": out.display().to_string(),
            "request": request,
            "digest64": request.digest().to_string(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{} request for {} ({} scope) -> {}",
            request.operation,
            request.target_platform,
            request.install_scope,
            out.display()
        );
    }
    Ok(EXIT_SUCCESS)
}
