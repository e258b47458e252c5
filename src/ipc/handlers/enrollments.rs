use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Role, Session};
use crate::rules;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_row(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<(String, i64)>> {
    conn.query_row(
        "SELECT role, active FROM users WHERE id = ?",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
}

/// Enrollment writes need an acting user: the student themself or an admin.
fn authorize_enrollment_write(
    session: Option<&Session>,
    student_id: &str,
) -> Result<(), (&'static str, String)> {
    let Some(session) = session else {
        return Err(("no_session", "open a session first".to_string()));
    };
    match session.role {
        Role::Admin => Ok(()),
        Role::Student if session.user_id == student_id => Ok(()),
        _ => Err((
            "forbidden",
            "only the student or an admin may change this enrollment".to_string(),
        )),
    }
}

fn handle_enrollment_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let info = match rules::load_section_info(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let enrolled = match rules::load_period_load(conn, &student_id, &info.period) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let candidate = rules::SectionLoad {
        section_id: info.section_id.clone(),
        course_code: info.course_code.clone(),
        credits: info.credits,
        day: info.day.clone(),
        start_time: info.start_time.clone(),
    };
    let check = rules::check_enrollment(&candidate, &enrolled);
    let current_credits: i64 = enrolled.iter().map(|s| s.credits).sum();

    ok(
        &req.id,
        json!({
            "check": check,
            "period": info.period,
            "currentCredits": current_credits,
            "candidateCredits": info.credits,
            "creditLimit": rules::MAX_PERIOD_CREDITS,
        }),
    )
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    if let Err((code, message)) = authorize_enrollment_write(state.session.as_ref(), &student_id) {
        return err(&req.id, code, message, None);
    }

    let student = match student_row(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((role, active)) = student else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if role != "student" {
        return err(
            &req.id,
            "bad_params",
            "only students can be enrolled",
            Some(json!({ "role": role })),
        );
    }
    if active == 0 {
        return err(&req.id, "forbidden", "student is inactive", None);
    }

    let info = match rules::load_section_info(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let duplicate: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE section_id = ? AND student_id = ?",
            (&section_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "duplicate_enrollment",
            "student is already enrolled in this section",
            None,
        );
    }

    // The pre-flight gate runs again here against live data; a stale client
    // snapshot must not slip an over-limit enrollment through.
    let enrolled = match rules::load_period_load(conn, &student_id, &info.period) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let candidate = rules::SectionLoad {
        section_id: info.section_id.clone(),
        course_code: info.course_code.clone(),
        credits: info.credits,
        day: info.day.clone(),
        start_time: info.start_time.clone(),
    };
    let check = rules::check_enrollment(&candidate, &enrolled);
    if !check.ok {
        return err(
            &req.id,
            "enrollment_rejected",
            check.reason.unwrap_or_else(|| "enrollment rejected".to_string()),
            None,
        );
    }

    // Capacity is the server-side rule the pre-flight deliberately does not
    // cover; it is enforced only here.
    let enrolled_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE section_id = ?",
        [&section_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrolled_count >= info.capacity {
        return err(
            &req.id,
            "capacity_exhausted",
            "section is full",
            Some(json!({ "capacity": info.capacity, "enrolled": enrolled_count })),
        );
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, section_id, student_id, enrolled_at)
         VALUES(?, ?, ?, ?)",
        (
            &enrollment_id,
            &section_id,
            &student_id,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "sectionId": section_id,
            "studentId": student_id,
        }),
    )
}

fn handle_enrollments_list_by_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "enrollments": [] }));
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

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.section_id, c.code, c.name, c.credits, s.period,
                s.day, s.start_time, s.end_time, e.enrolled_at
         FROM enrollments e
         JOIN sections s ON s.id = e.section_id
         JOIN courses c ON c.id = s.course_id
         WHERE e.student_id = ?1 AND (?2 IS NULL OR s.period = ?2)
         ORDER BY s.period, c.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&student_id, period.as_deref()), |row| {
            let id: String = row.get(0)?;
            let section_id: String = row.get(1)?;
            let code: String = row.get(2)?;
            let name: String = row.get(3)?;
            let credits: i64 = row.get(4)?;
            let period: String = row.get(5)?;
            let day: String = row.get(6)?;
            let start_time: String = row.get(7)?;
            let end_time: String = row.get(8)?;
            let enrolled_at: Option<String> = row.get(9)?;
            Ok(json!({
                "id": id,
                "sectionId": section_id,
                "courseCode": code,
                "courseName": name,
                "credits": credits,
                "period": period,
                "day": day,
                "startTime": start_time,
                "endTime": end_time,
                "enrolledAt": enrolled_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_list_by_section(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "enrollments": [] }));
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, u.id, u.last_name, u.first_name, e.enrolled_at
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         WHERE e.section_id = ?
         ORDER BY u.last_name, u.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&section_id], |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let last: String = row.get(2)?;
            let first: String = row.get(3)?;
            let enrolled_at: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "enrolledAt": enrolled_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };

    let student_id: Option<String> = match conn
        .query_row(
            "SELECT student_id FROM enrollments WHERE id = ?",
            [&enrollment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student_id) = student_id else {
        return err(&req.id, "not_found", "enrollment not found", None);
    };

    if let Err((code, message)) = authorize_enrollment_write(state.session.as_ref(), &student_id) {
        return err(&req.id, code, message, None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM grades WHERE enrollment_id = ?", [&enrollment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.check" => Some(handle_enrollment_check(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.listByStudent" => Some(handle_enrollments_list_by_student(state, req)),
        "enrollments.listBySection" => Some(handle_enrollments_list_by_section(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        _ => None,
    }
}
