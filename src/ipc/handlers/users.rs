use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Role};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "users": [] }));
    };

    let role_filter = req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(r) = role_filter.as_deref() {
        if Role::parse(r).is_none() {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: admin, teacher, student",
                Some(json!({ "role": r })),
            );
        }
    }

    // Enrollment counts let the UI render the student dashboard without a
    // second round trip.
    let mut stmt = match conn.prepare(
        "SELECT
           u.id,
           u.last_name,
           u.first_name,
           u.email,
           u.role,
           u.active,
           (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = u.id) AS enrollment_count
         FROM users u
         WHERE ?1 IS NULL OR u.role = ?1
         ORDER BY u.last_name, u.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([role_filter.as_deref()], |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let email: Option<String> = row.get(3)?;
            let role: String = row.get(4)?;
            let active: i64 = row.get(5)?;
            let enrollment_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "email": email,
                "role": role,
                "active": active != 0,
                "enrollmentCount": enrollment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(&req.id, "bad_params", "names must not be empty", None);
    }
    let role = match req.params.get("role").and_then(|v| v.as_str()) {
        Some(v) => match Role::parse(v) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: admin, teacher, student",
                    Some(json!({ "role": v })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing role", None),
    };
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, last_name, first_name, email, role, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &last_name,
            &first_name,
            &email,
            role.as_str(),
            active as i64,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({ "userId": user_id, "role": role.as_str() }),
    )
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let row: Option<(String, String, Option<String>, String, i64)> = match conn
        .query_row(
            "SELECT last_name, first_name, email, role, active FROM users WHERE id = ?",
            [&user_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((mut last_name, mut first_name, mut email, mut role_s, mut active)) = row else {
        return err(&req.id, "not_found", "user not found", None);
    };

    if let Some(v) = patch.get("lastName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "lastName must not be empty", None);
        }
        last_name = v.to_string();
    }
    if let Some(v) = patch.get("firstName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "firstName must not be empty", None);
        }
        first_name = v.to_string();
    }
    if patch.contains_key("email") {
        email = patch
            .get("email")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }
    if let Some(v) = patch.get("role").and_then(|v| v.as_str()) {
        let Some(r) = Role::parse(v) else {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: admin, teacher, student",
                Some(json!({ "role": v })),
            );
        };
        role_s = r.as_str().to_string();
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        active = v as i64;
    }

    if let Err(e) = conn.execute(
        "UPDATE users SET last_name = ?, first_name = ?, email = ?, role = ?, active = ?
         WHERE id = ?",
        (&last_name, &first_name, &email, &role_s, active, &user_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };

    let role: Option<String> = match conn
        .query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role) = role else {
        return err(&req.id, "not_found", "user not found", None);
    };

    // A teacher who still owns sections blocks deletion; reassign first.
    let section_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM sections WHERE teacher_id = ?",
        [&user_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if section_count > 0 {
        return err(
            &req.id,
            "user_in_use",
            "user still teaches sections; reassign them first",
            Some(json!({ "sectionCount": section_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if role == "student" {
        if let Err(e) = tx.execute(
            "DELETE FROM grades
             WHERE enrollment_id IN (SELECT id FROM enrollments WHERE student_id = ?)",
            [&user_id],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "grades" })),
            );
        }
        if let Err(e) = tx.execute("DELETE FROM enrollments WHERE student_id = ?", [&user_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "enrollments" })),
            );
        }
    }

    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // Deleting the acting user invalidates the open session.
    if state
        .session
        .as_ref()
        .map(|s| s.user_id == user_id)
        .unwrap_or(false)
    {
        state.session = None;
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
