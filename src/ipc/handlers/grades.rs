use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Role, Session};
use crate::rules;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Recording marks is a teaching action; students cannot write their own.
fn authorize_grade_write(session: Option<&Session>) -> Result<(), (&'static str, String)> {
    let Some(session) = session else {
        return Err(("no_session", "open a session first".to_string()));
    };
    match session.role {
        Role::Teacher | Role::Admin => Ok(()),
        Role::Student => Err((
            "forbidden",
            "only teachers or admins may record grades".to_string(),
        )),
    }
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Err((code, message)) = authorize_grade_write(state.session.as_ref()) {
        return err(&req.id, code, message, None);
    }

    let evaluation_id = match req.params.get("evaluationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing evaluationId", None),
    };
    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };
    let score = match req.params.get("score").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing numeric score", None),
    };
    // Validated here so the aggregator downstream only ever sees real
    // numbers on the 0-100 scale.
    if !rules::valid_score(score) {
        return err(
            &req.id,
            "bad_params",
            "score must be a number between 0 and 100",
            Some(json!({ "score": score })),
        );
    }

    // The grade must attach to an evaluation of the section the enrollment
    // belongs to; a mismatched pair is a caller bug, not a new grade.
    let pair_ok: Option<i64> = match conn
        .query_row(
            "SELECT 1
             FROM evaluations ev
             JOIN enrollments e ON e.section_id = ev.section_id
             WHERE ev.id = ? AND e.id = ?",
            (&evaluation_id, &enrollment_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if pair_ok.is_none() {
        return err(
            &req.id,
            "not_found",
            "evaluation and enrollment do not belong to the same section",
            None,
        );
    }

    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, evaluation_id, enrollment_id, score, graded_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(evaluation_id, enrollment_id) DO UPDATE SET
           score = excluded.score,
           graded_at = excluded.graded_at",
        (
            &grade_id,
            &evaluation_id,
            &enrollment_id,
            score,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    ok(
        &req.id,
        json!({
            "evaluationId": evaluation_id,
            "enrollmentId": enrollment_id,
            "score": score
        }),
    )
}

fn handle_grades_list_by_enrollment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "grades": [] }));
    };

    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.evaluation_id, ev.title, ev.weight_percent, g.score, g.graded_at
         FROM grades g
         JOIN evaluations ev ON ev.id = g.evaluation_id
         WHERE g.enrollment_id = ?
         ORDER BY ev.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&enrollment_id], |row| {
            let id: String = row.get(0)?;
            let evaluation_id: String = row.get(1)?;
            let title: String = row.get(2)?;
            let weight_percent: i64 = row.get(3)?;
            let score: f64 = row.get(4)?;
            let graded_at: Option<String> = row.get(5)?;
            Ok(json!({
                "id": id,
                "evaluationId": evaluation_id,
                "evaluationTitle": title,
                "weightPercent": weight_percent,
                "score": score,
                "gradedAt": graded_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Err((code, message)) = authorize_grade_write(state.session.as_ref()) {
        return err(&req.id, code, message, None);
    }

    let grade_id = match req.params.get("gradeId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing gradeId", None),
    };

    let deleted = match conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "grades" })),
            )
        }
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "grade not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.listByEnrollment" => Some(handle_grades_list_by_enrollment(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
