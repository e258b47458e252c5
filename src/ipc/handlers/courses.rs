use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Section counts feed the catalog dashboard.
    // Use a correlated subquery to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.code,
           c.name,
           c.credits,
           (SELECT COUNT(*) FROM sections s WHERE s.course_id = c.id) AS section_count
         FROM courses c
         ORDER BY c.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            let credits: i64 = row.get(3)?;
            let section_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "credits": credits,
                "sectionCount": section_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let code = match req.params.get("code").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing code", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if code.is_empty() || name.is_empty() {
        return err(&req.id, "bad_params", "code and name must not be empty", None);
    }
    let credits = match req.params.get("credits").and_then(|v| v.as_i64()) {
        Some(v) if v >= 1 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "credits must be >= 1",
                Some(json!({ "credits": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing credits", None),
    };

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, code, name, credits) VALUES(?, ?, ?, ?)",
        (&course_id, &code, &name, credits),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "code": code }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let row: Option<(String, String, i64)> = match conn
        .query_row(
            "SELECT code, name, credits FROM courses WHERE id = ?",
            [&course_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((mut code, mut name, mut credits)) = row else {
        return err(&req.id, "not_found", "course not found", None);
    };

    if let Some(v) = patch.get("code").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "code must not be empty", None);
        }
        code = v.to_string();
    }
    if let Some(v) = patch.get("name").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        name = v.to_string();
    }
    if let Some(v) = patch.get("credits").and_then(|v| v.as_i64()) {
        if v < 1 {
            return err(
                &req.id,
                "bad_params",
                "credits must be >= 1",
                Some(json!({ "credits": v })),
            );
        }
        credits = v;
    }

    if let Err(e) = conn.execute(
        "UPDATE courses SET code = ?, name = ?, credits = ? WHERE id = ?",
        (&code, &name, credits, &course_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id }))
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grades
         WHERE evaluation_id IN (
           SELECT ev.id
           FROM evaluations ev
           JOIN sections s ON s.id = ev.section_id
           WHERE s.course_id = ?
         )",
        [&course_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM evaluations
         WHERE section_id IN (SELECT id FROM sections WHERE course_id = ?)",
        [&course_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM enrollments
         WHERE section_id IN (SELECT id FROM sections WHERE course_id = ?)",
        [&course_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM sections WHERE course_id = ?", [&course_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM courses WHERE id = ?", [&course_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        _ => None,
    }
}
