use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rules;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn section_exists(conn: &Connection, section_id: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM sections WHERE id = ?", [section_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn evaluation_type_exists(conn: &Connection, type_id: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM evaluation_types WHERE id = ?",
            [type_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn parse_weight_percent(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_i64()) {
        Some(v) if (1..=100).contains(&v) => Ok(v),
        Some(v) => Err(err(
            &req.id,
            "bad_params",
            "weightPercent must be an integer between 1 and 100",
            Some(json!({ "weightPercent": v })),
        )),
        None => Err(err(
            &req.id,
            "bad_params",
            format!("missing {}", key),
            None,
        )),
    }
}

fn handle_evaluation_types_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "evaluationTypes": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM evaluation_types ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(types) => ok(&req.id, json!({ "evaluationTypes": types })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "evaluations": [] }));
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT ev.id, ev.title, ev.evaluation_type_id, et.name, ev.weight_percent
         FROM evaluations ev
         JOIN evaluation_types et ON et.id = ev.evaluation_type_id
         WHERE ev.section_id = ?
         ORDER BY ev.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&section_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let type_id: String = row.get(2)?;
            let type_name: String = row.get(3)?;
            let weight_percent: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "title": title,
                "evaluationTypeId": type_id,
                "typeName": type_name,
                "weightPercent": weight_percent
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    let evaluations = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let weight_used: i64 = evaluations
        .iter()
        .filter_map(|e| e.get("weightPercent").and_then(|v| v.as_i64()))
        .sum();

    ok(
        &req.id,
        json!({
            "evaluations": evaluations,
            "weightUsed": weight_used,
            "weightAvailable": 100 - weight_used
        }),
    )
}

fn handle_evaluations_check_weight(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let weight_percent = match parse_weight_percent(req, "weightPercent") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let exclude_id = req
        .params
        .get("excludeId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let existing = match rules::load_section_weights(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let check = rules::check_evaluation_weight(weight_percent, &existing, exclude_id.as_deref());
    ok(&req.id, json!({ "check": check }))
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let type_id = match req.params.get("evaluationTypeId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing evaluationTypeId", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing title", None),
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let weight_percent = match parse_weight_percent(req, "weightPercent") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match section_exists(conn, &section_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "section not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match evaluation_type_exists(conn, &type_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "evaluation type not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let existing = match rules::load_section_weights(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let check = rules::check_evaluation_weight(weight_percent, &existing, None);
    if !check.valid {
        return err(
            &req.id,
            "weight_exceeded",
            check.message,
            Some(json!({ "availablePercent": check.available_percent })),
        );
    }

    let evaluation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(id, section_id, evaluation_type_id, title, weight_percent)
         VALUES(?, ?, ?, ?, ?)",
        (&evaluation_id, &section_id, &type_id, &title, weight_percent),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    ok(&req.id, json!({ "evaluationId": evaluation_id }))
}

fn handle_evaluations_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let evaluation_id = match req.params.get("evaluationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing evaluationId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let row: Option<(String, String, String, i64)> = match conn
        .query_row(
            "SELECT section_id, evaluation_type_id, title, weight_percent
             FROM evaluations WHERE id = ?",
            [&evaluation_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((section_id, mut type_id, mut title, mut weight_percent)) = row else {
        return err(&req.id, "not_found", "evaluation not found", None);
    };

    if let Some(v) = patch.get("evaluationTypeId").and_then(|v| v.as_str()) {
        match evaluation_type_exists(conn, v) {
            Ok(true) => type_id = v.to_string(),
            Ok(false) => return err(&req.id, "not_found", "evaluation type not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(v) = patch.get("title").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "title must not be empty", None);
        }
        title = v.to_string();
    }
    if let Some(v) = patch.get("weightPercent") {
        let Some(v) = v.as_i64().filter(|v| (1..=100).contains(v)) else {
            return err(
                &req.id,
                "bad_params",
                "weightPercent must be an integer between 1 and 100",
                Some(json!({ "weightPercent": v })),
            );
        };

        // Same check as create, with this evaluation's own weight excluded
        // from the sum.
        let existing = match rules::load_section_weights(conn, &section_id) {
            Ok(list) => list,
            Err(e) => return err(&req.id, &e.code, e.message, e.details),
        };
        let check = rules::check_evaluation_weight(v, &existing, Some(evaluation_id.as_str()));
        if !check.valid {
            return err(
                &req.id,
                "weight_exceeded",
                check.message,
                Some(json!({ "availablePercent": check.available_percent })),
            );
        }
        weight_percent = v;
    }

    if let Err(e) = conn.execute(
        "UPDATE evaluations
         SET evaluation_type_id = ?, title = ?, weight_percent = ?
         WHERE id = ?",
        (&type_id, &title, weight_percent, &evaluation_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    ok(&req.id, json!({ "evaluationId": evaluation_id }))
}

fn handle_evaluations_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let evaluation_id = match req.params.get("evaluationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing evaluationId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM evaluations WHERE id = ?",
            [&evaluation_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "evaluation not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM grades WHERE evaluation_id = ?", [&evaluation_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM evaluations WHERE id = ?", [&evaluation_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluationTypes.list" => Some(handle_evaluation_types_list(state, req)),
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        "evaluations.checkWeight" => Some(handle_evaluations_check_weight(state, req)),
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.update" => Some(handle_evaluations_update(state, req)),
        "evaluations.delete" => Some(handle_evaluations_delete(state, req)),
        _ => None,
    }
}
