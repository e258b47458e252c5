use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Role, Session};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;

fn session_json(session: &Session) -> serde_json::Value {
    json!({
        "userId": session.user_id,
        "displayName": session.display_name,
        "role": session.role.as_str(),
        "openedAt": session.opened_at.to_rfc3339(),
    })
}

fn handle_session_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };

    let row: Option<(String, String, String, i64)> = match conn
        .query_row(
            "SELECT last_name, first_name, role, active FROM users WHERE id = ?",
            [&user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((last, first, role_s, active)) = row else {
        return err(&req.id, "not_found", "user not found", None);
    };
    if active == 0 {
        return err(
            &req.id,
            "forbidden",
            "inactive users cannot open a session",
            None,
        );
    }
    let Some(role) = Role::parse(&role_s) else {
        return err(
            &req.id,
            "db_query_failed",
            format!("user has unknown role: {}", role_s),
            None,
        );
    };

    let session = Session {
        user_id,
        display_name: format!("{}, {}", last, first),
        role,
        opened_at: Utc::now(),
    };
    let body = session_json(&session);
    state.session = Some(session);
    ok(&req.id, json!({ "session": body }))
}

fn handle_session_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.as_ref() {
        Some(s) => ok(&req.id, json!({ "session": session_json(s) })),
        None => ok(&req.id, json!({ "session": serde_json::Value::Null })),
    }
}

fn handle_session_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let closed = state.session.take().is_some();
    ok(&req.id, json!({ "closed": closed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.open" => Some(handle_session_open(state, req)),
        "session.current" => Some(handle_session_current(state, req)),
        "session.close" => Some(handle_session_close(state, req)),
        _ => None,
    }
}
