use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rules;
use serde_json::json;

fn handle_student_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let period = req
        .params
        .get("period")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match rules::compute_student_summary(conn, &student_id, period.as_deref()) {
        Ok(model) => ok(&req.id, json!({ "summary": model })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_section_roster(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    match rules::compute_section_roster(conn, &section_id) {
        Ok(model) => ok(&req.id, json!({ "roster": model })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentSummary" => Some(handle_student_summary(state, req)),
        "reports.sectionRoster" => Some(handle_section_roster(state, req)),
        _ => None,
    }
}
