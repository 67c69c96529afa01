//! Human-readable output.

use std::fmt::Write;

use colored::Colorize;
use stepguard_common::protocol::{CurrentOpReply, ReplSetStatus};
use stepguard_common::scenario::{ScenarioOutcome, ScenarioReport};

pub fn report(report: &ScenarioReport) -> String {
    let mut out = String::new();
    let verdict = match &report.outcome {
        ScenarioOutcome::Passed => "PASS".green().bold(),
        ScenarioOutcome::Failed { .. } => "FAIL".red().bold(),
    };
    let _ = writeln!(
        out,
        "{verdict} {} against {} on {} (run {})",
        report.scenario, report.endpoint, report.namespace, report.run_id
    );

    for record in &report.phases {
        let _ = writeln!(
            out,
            "  {} {}",
            record.entered_at.format("%H:%M:%S%.3f").to_string().dimmed(),
            record.phase
        );
    }
    for actor in &report.actors {
        let _ = writeln!(out, "  actor {:<10} {}", actor.name, actor.outcome);
    }
    if let (Some(parked_at), Some(marker)) = (report.parked_at, &report.marker) {
        let _ = writeln!(
            out,
            "  parked at log #{parked_at}, transition marker at #{}",
            marker.seq
        );
    }

    if let ScenarioOutcome::Failed {
        phase,
        code,
        error,
        remediation,
    } = &report.outcome
    {
        let _ = writeln!(out, "  {} [{code}] in {phase}: {error}", "error".red());
        for hint in remediation {
            let _ = writeln!(out, "    - {hint}");
        }
        if let Some(diagnostic) = &report.last_diagnostic {
            let _ = writeln!(out, "  last diagnostic: {diagnostic}");
        }
    }
    if !report.fail_points.is_empty() {
        let _ = writeln!(out, "  fail points released on teardown: {}", report.fail_points.join(", "));
    }
    for err in &report.teardown_errors {
        let _ = writeln!(out, "  {} {err}", "teardown:".yellow());
    }
    out
}

pub fn current_op(reply: &CurrentOpReply) -> String {
    let mut out = String::new();
    if reply.inprog.is_empty() {
        let _ = writeln!(out, "no operations in progress (log position #{})", reply.log_position);
        return out;
    }
    for op in &reply.inprog {
        let _ = writeln!(
            out,
            "{:>6} {:<8} {:<20} conn={} {}s{}{}",
            op.opid,
            op.op,
            op.ns.to_string(),
            op.connection_id,
            op.secs_running,
            op.msg
                .as_deref()
                .map(|m| format!(" msg={m}"))
                .unwrap_or_default(),
            if op.killable_on_step_down { " killable" } else { "" }
        );
    }
    let _ = writeln!(out, "log position #{}", reply.log_position);
    out
}

pub fn status(status: &ReplSetStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", status.set_name.bold(), status.my_state);
    for member in &status.members {
        let _ = writeln!(
            out,
            "  {:<8} {:<10} applied={} priority={}",
            member.name,
            member.state.to_string(),
            member.applied_op_time,
            member.priority
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepguard_common::protocol::{MemberStatus, OperationInfo};
    use stepguard_common::scenario::ScenarioConfig;
    use stepguard_common::types::{Endpoint, MemberState, Namespace};
    use stepguard_common::ErrorCode;

    #[test]
    fn test_failed_report_shows_code_and_hints() {
        colored::control::set_override(false);
        let config = ScenarioConfig::new(Endpoint::new("127.0.0.1:1"), Namespace::new("test", "coll"));
        let mut report = ScenarioReport::new(&config);
        report.outcome = ScenarioOutcome::Failed {
            phase: stepguard_common::ScenarioPhase::Drained,
            code: ErrorCode::JoinTimeout.code_string(),
            error: "Actor 'getMore' did not finish within 1s".to_string(),
            remediation: vec!["Check fail points were released".to_string()],
        };
        report.finished_at = Some(Utc::now());

        let text = super::report(&report);
        assert!(text.starts_with("FAIL"));
        assert!(text.contains(&ErrorCode::JoinTimeout.code_string()));
        assert!(text.contains("- Check fail points were released"));
    }

    #[test]
    fn test_current_op_lists_message() {
        colored::control::set_override(false);
        let reply = CurrentOpReply {
            inprog: vec![OperationInfo {
                opid: 3,
                ns: Namespace::new("test", "coll"),
                op: "getmore".to_string(),
                msg: Some("waitAfterPinningCursorBeforeGetMoreBatch".to_string()),
                secs_running: 0,
                connection_id: 2,
                killable_on_step_down: false,
            }],
            log_position: 12,
        };
        let text = current_op(&reply);
        assert!(text.contains("msg=waitAfterPinningCursorBeforeGetMoreBatch"));
        assert!(text.contains("#12"));
    }

    #[test]
    fn test_status_lists_members() {
        colored::control::set_override(false);
        let status = ReplSetStatus {
            set_name: "rs0".to_string(),
            my_state: MemberState::Secondary,
            members: vec![MemberStatus {
                name: "node1".to_string(),
                state: MemberState::Secondary,
                applied_op_time: 4,
                priority: 0,
            }],
        };
        let text = super::status(&status);
        assert!(text.contains("rs0 (SECONDARY)"));
        assert!(text.contains("applied=4 priority=0"));
    }
}
