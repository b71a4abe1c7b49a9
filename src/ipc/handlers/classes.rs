use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn class_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let class_name: String = row.get(1)?;
    let class_teacher: String = row.get(2)?;
    let student_count: i64 = row.get(3)?;
    Ok(json!({
        "id": id,
        "className": class_name,
        "classTeacher": class_teacher,
        "studentCount": student_count
    }))
}

const CLASS_SELECT: &str = "SELECT
       c.id,
       c.class_name,
       c.class_teacher,
       (SELECT COUNT(*) FROM students s WHERE s.class_name = c.class_name) AS student_count
     FROM classes c";

fn class_name_taken(conn: &Connection, class_name: &str, except_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM classes WHERE class_name = ?",
            [class_name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match (found, except_id) {
        (Some(id), Some(except)) => id != except,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let sql = format!("{} ORDER BY c.class_name", CLASS_SELECT);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], class_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let sql = format!("{} WHERE c.id = ?", CLASS_SELECT);
    match conn.query_row(&sql, [&class_id], class_json).optional() {
        Ok(Some(class)) => ok(&req.id, json!({ "class": class })),
        Ok(None) => err(&req.id, "not_found", "class not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_teacher = match required_str(req, "classTeacher") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match class_name_taken(conn, &class_name, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                format!("class {} already exists", class_name),
                Some(json!({ "className": class_name })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, class_name, class_teacher) VALUES(?, ?, ?)",
        (&class_id, &class_name, &class_teacher),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "className": class_name,
            "classTeacher": class_teacher
        }),
    )
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    for (key, column) in [("className", "class_name"), ("classTeacher", "class_teacher")] {
        let Some(v) = patch.get(key) else {
            continue;
        };
        let Some(s) = v.as_str().map(|s| s.trim().to_string()) else {
            return err(
                &req.id,
                "bad_params",
                format!("patch.{} must be a string", key),
                None,
            );
        };
        if s.is_empty() {
            return err(&req.id, "bad_params", format!("{} must not be empty", key), None);
        }
        if key == "className" {
            match class_name_taken(conn, &s, Some(&class_id)) {
                Ok(true) => {
                    return err(
                        &req.id,
                        "conflict",
                        format!("class {} already exists", s),
                        Some(json!({ "className": s })),
                    )
                }
                Ok(false) => {}
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        set_parts.push(format!("{} = ?", column));
        bind_values.push(Value::Text(s));
    }
    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "patch has no updatable fields", None);
    }

    let sql = format!("UPDATE classes SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(class_id.clone()));
    match conn.execute(&sql, params_from_iter(bind_values.iter())) {
        Ok(0) => err(&req.id, "not_found", "class not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true, "classId": class_id })),
        Err(e) => err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        ),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Students keep their class label; only the class record goes.
    match conn.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        Ok(0) => err(&req.id, "not_found", "class not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.get" => Some(handle_classes_get(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
