use super::{
    colorize_status, json_pretty, load_plan, spin_fail, spin_ok, CliError, CmdResult, Session,
    EXIT_SUCCESS,
};
use dsk_core::{ApplyReport, CoreError, Engine, Failpoints, ProgressEvent};
use indicatif::ProgressBar;
use std::path::Path;

fn describe(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::StepStarted {
            step_id,
            kind,
            total,
        } => format!("[{step_id}/{total}] {kind}"),
        ProgressEvent::StepSkipped { step_id, kind } => format!("skipping {kind} ({step_id})"),
        ProgressEvent::StepCompleted { step_id, kind } => format!("{kind} ({step_id}) done"),
        ProgressEvent::FileCommitted { path } => format!("committed {path}"),
        ProgressEvent::RolledBack { restored, removed } => {
            format!("rolled back: {restored} restored, {removed} removed")
        }
    }
}

fn finish<T>(
    pb: Option<&ProgressBar>,
    result: Result<T, CoreError>,
    ok: &str,
    fail: &str,
) -> Result<T, CliError> {
    match result {
        Ok(v) => {
            if let Some(pb) = pb {
                spin_ok(pb, ok);
            }
            Ok(v)
        }
        Err(e) => {
            if let Some(pb) = pb {
                spin_fail(pb, fail);
            }
            Err(CliError::status(&e))
        }
    }
}

fn print_report(session: &Session, report: &ApplyReport) -> CmdResult {
    if session.json {
        println!("{}", json_pretty(report)?);
        return Ok(EXIT_SUCCESS);
    }
    let outcome = if report.dry_run { "dry_run" } else { "applied" };
    println!(
        "{} plan {}: {} written, {} removed ({} steps run, {} skipped)",
        colorize_status(outcome),
        report.plan_digest64,
        report.files_written,
        report.files_removed,
        report.steps_run,
        report.steps_skipped
    );
    match report.state_digest64 {
        Some(d) => println!("installed state {d}"),
        None => println!("installed state removed"),
    }
    Ok(EXIT_SUCCESS)
}

pub fn apply(
    session: &Session,
    plan: &Path,
    dry_run: bool,
    failpoints: Option<&str>,
) -> CmdResult {
    let plan = load_plan(plan)?;

    let pb = session.spinner("applying...");
    let sink = |event: &ProgressEvent| {
        if let Some(pb) = &pb {
            pb.set_message(describe(event));
        }
    };
    let engine = Engine::new(&session.fs)
        .with_progress(&sink)
        .with_failpoints(failpoints.map_or_else(Failpoints::none, Failpoints::parse_list));
    let result = engine.apply(&plan, dry_run);
    let report = finish(pb.as_ref(), result, "apply complete", "apply failed")?;
    print_report(session, &report)
}

pub fn resume(session: &Session, plan: &Path, failpoints: Option<&str>) -> CmdResult {
    let plan = load_plan(plan)?;

    let pb = session.spinner("resuming...");
    let sink = |event: &ProgressEvent| {
        if let Some(pb) = &pb {
            pb.set_message(describe(event));
        }
    };
    let engine = Engine::new(&session.fs)
        .with_progress(&sink)
        .with_failpoints(failpoints.map_or_else(Failpoints::none, Failpoints::parse_list));
    let result = engine.resume(&plan);
    let report = finish(pb.as_ref(), result, "resume complete", "resume failed")?;
    print_report(session, &report)
}

pub fn rollback(session: &Session, plan: &Path) -> CmdResult {
    let plan = load_plan(plan)?;

    let pb = session.spinner("rolling back...");
    let engine = Engine::new(&session.fs);
    let result = engine.rollback(&plan);
    let report = finish(pb.as_ref(), result, "rollback complete", "rollback failed")?;

    if session.json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "{} plan {}: {} restored, {} removed{}",
            colorize_status("rolled_back"),
            report.plan_digest64,
            report.restored,
            report.removed,
            if report.state_restored {
                ", installed state restored"
            } else {
                ""
            }
        );
    }
    Ok(EXIT_SUCCESS)
}
