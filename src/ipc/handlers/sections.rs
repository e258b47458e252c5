use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_slot_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

struct SlotFields {
    day: String,
    start_time: String,
    end_time: String,
}

fn validate_slot(day: &str, start_time: &str, end_time: &str) -> Result<SlotFields, String> {
    let day = day.trim();
    if day.is_empty() {
        return Err("day must not be empty".to_string());
    }
    let Some(start) = parse_slot_time(start_time) else {
        return Err(format!("startTime must be HH:MM, got {}", start_time));
    };
    let Some(end) = parse_slot_time(end_time) else {
        return Err(format!("endTime must be HH:MM, got {}", end_time));
    };
    if end <= start {
        return Err(format!(
            "endTime {} must be after startTime {}",
            end_time, start_time
        ));
    }
    Ok(SlotFields {
        day: day.to_string(),
        start_time: start_time.to_string(),
        end_time: end_time.to_string(),
    })
}

fn teacher_exists(conn: &rusqlite::Connection, teacher_id: &str) -> rusqlite::Result<bool> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [teacher_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(matches!(role.as_deref(), Some("teacher") | Some("admin")))
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sections": [] }));
    };

    let course_id = req
        .params
        .get("courseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let period = req
        .params
        .get("period")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.course_id,
           c.code,
           c.name,
           c.credits,
           s.teacher_id,
           t.last_name || ', ' || t.first_name AS teacher_name,
           s.period,
           s.day,
           s.start_time,
           s.end_time,
           s.capacity,
           (SELECT COUNT(*) FROM enrollments e WHERE e.section_id = s.id) AS enrolled_count
         FROM sections s
         JOIN courses c ON c.id = s.course_id
         JOIN users t ON t.id = s.teacher_id
         WHERE (?1 IS NULL OR s.course_id = ?1)
           AND (?2 IS NULL OR s.period = ?2)
         ORDER BY s.period, c.code, s.day, s.start_time",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((course_id.as_deref(), period.as_deref()), |row| {
            let id: String = row.get(0)?;
            let course_id: String = row.get(1)?;
            let code: String = row.get(2)?;
            let name: String = row.get(3)?;
            let credits: i64 = row.get(4)?;
            let teacher_id: String = row.get(5)?;
            let teacher_name: String = row.get(6)?;
            let period: String = row.get(7)?;
            let day: String = row.get(8)?;
            let start_time: String = row.get(9)?;
            let end_time: String = row.get(10)?;
            let capacity: i64 = row.get(11)?;
            let enrolled_count: i64 = row.get(12)?;
            Ok(json!({
                "id": id,
                "courseId": course_id,
                "courseCode": code,
                "courseName": name,
                "credits": credits,
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "period": period,
                "day": day,
                "startTime": start_time,
                "endTime": end_time,
                "capacity": capacity,
                "enrolledCount": enrolled_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let period = match req.params.get("period").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing period", None),
    };
    if period.is_empty() {
        return err(&req.id, "bad_params", "period must not be empty", None);
    }
    let day = req.params.get("day").and_then(|v| v.as_str()).unwrap_or("");
    let start_time = req
        .params
        .get("startTime")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let end_time = req
        .params
        .get("endTime")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let slot = match validate_slot(day, start_time, end_time) {
        Ok(s) => s,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let capacity = match req.params.get("capacity").and_then(|v| v.as_i64()) {
        Some(v) if v >= 1 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "capacity must be >= 1",
                Some(json!({ "capacity": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing capacity", None),
    };

    let course_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "bad_params",
                "teacherId must reference a teacher",
                Some(json!({ "teacherId": teacher_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, course_id, teacher_id, period, day, start_time, end_time, capacity)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &section_id,
            &course_id,
            &teacher_id,
            &period,
            &slot.day,
            &slot.start_time,
            &slot.end_time,
            capacity,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        );
    }

    ok(&req.id, json!({ "sectionId": section_id }))
}

fn handle_sections_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let row: Option<(String, String, String, String, String, i64)> = match conn
        .query_row(
            "SELECT teacher_id, period, day, start_time, end_time, capacity
             FROM sections WHERE id = ?",
            [&section_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((mut teacher_id, mut period, mut day, mut start_time, mut end_time, mut capacity)) =
        row
    else {
        return err(&req.id, "not_found", "section not found", None);
    };

    if let Some(v) = patch.get("teacherId").and_then(|v| v.as_str()) {
        match teacher_exists(conn, v) {
            Ok(true) => teacher_id = v.to_string(),
            Ok(false) => {
                return err(
                    &req.id,
                    "bad_params",
                    "teacherId must reference a teacher",
                    Some(json!({ "teacherId": v })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(v) = patch.get("period").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "period must not be empty", None);
        }
        period = v.to_string();
    }
    if let Some(v) = patch.get("day").and_then(|v| v.as_str()) {
        day = v.to_string();
    }
    if let Some(v) = patch.get("startTime").and_then(|v| v.as_str()) {
        start_time = v.to_string();
    }
    if let Some(v) = patch.get("endTime").and_then(|v| v.as_str()) {
        end_time = v.to_string();
    }
    // Slot fields are validated together so a partial patch cannot leave an
    // inverted time range behind.
    let slot = match validate_slot(&day, &start_time, &end_time) {
        Ok(s) => s,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if let Some(v) = patch.get("capacity").and_then(|v| v.as_i64()) {
        if v < 1 {
            return err(
                &req.id,
                "bad_params",
                "capacity must be >= 1",
                Some(json!({ "capacity": v })),
            );
        }
        capacity = v;
    }

    if let Err(e) = conn.execute(
        "UPDATE sections
         SET teacher_id = ?, period = ?, day = ?, start_time = ?, end_time = ?, capacity = ?
         WHERE id = ?",
        (
            &teacher_id,
            &period,
            &slot.day,
            &slot.start_time,
            &slot.end_time,
            capacity,
            &section_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        );
    }

    ok(&req.id, json!({ "sectionId": section_id }))
}

fn handle_sections_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM sections WHERE id = ?", [&section_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "section not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grades
         WHERE evaluation_id IN (SELECT id FROM evaluations WHERE section_id = ?)",
        [&section_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM evaluations WHERE section_id = ?", [&section_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE section_id = ?", [&section_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM sections WHERE id = ?", [&section_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sections.list" => Some(handle_sections_list(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.update" => Some(handle_sections_update(state, req)),
        "sections.delete" => Some(handle_sections_delete(state, req)),
        _ => None,
    }
}
