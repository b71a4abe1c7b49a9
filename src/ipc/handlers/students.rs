use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_i64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;

const STUDENT_COLUMNS: &str = "id, first_name, last_name, class_name, placeholder, created_at";

fn student_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let first_name: String = row.get(1)?;
    let last_name: String = row.get(2)?;
    let class_name: String = row.get(3)?;
    let placeholder: i64 = row.get(4)?;
    let created_at: Option<String> = row.get(5)?;
    Ok(json!({
        "id": id,
        "firstName": first_name,
        "lastName": last_name,
        "displayName": format!("{} {}", first_name, last_name),
        "className": class_name,
        "placeholder": placeholder != 0,
        "createdAt": created_at
    }))
}

fn list_students(
    conn: &rusqlite::Connection,
    class_name: Option<&str>,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let rows = match class_name {
        Some(class_name) => {
            let sql = format!(
                "SELECT {} FROM students WHERE class_name = ? ORDER BY first_name, last_name, id",
                STUDENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([class_name], student_json)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {} FROM students ORDER BY class_name, first_name, last_name, id",
                STUDENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], student_json)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = req
        .params
        .get("className")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let rows = list_students(conn, class_name.as_deref());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_i64(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    match conn.query_row(&sql, [student_id], student_json).optional() {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(
            &req.id,
            "not_found",
            format!("Student with ID {} does not exist", student_id),
            None,
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let explicit_id = match req.params.get("id") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_i64() {
            Some(id) if id > 0 => Some(id),
            _ => return err(&req.id, "bad_params", "id must be a positive integer", None),
        },
    };

    if let Some(id) = explicit_id {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_some() {
            return err(
                &req.id,
                "conflict",
                format!("Student with ID {} already exists", id),
                Some(json!({ "studentId": id })),
            );
        }
    }

    if let Err(e) = conn.execute(
        "INSERT INTO students(id, first_name, last_name, class_name, placeholder, created_at)
         VALUES(?, ?, ?, ?, 0, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (explicit_id, &first_name, &last_name, &class_name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    let student_id = explicit_id.unwrap_or_else(|| conn.last_insert_rowid());

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_i64(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    for (key, column) in [
        ("firstName", "first_name"),
        ("lastName", "last_name"),
        ("className", "class_name"),
    ] {
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
        set_parts.push(format!("{} = ?", column));
        bind_values.push(Value::Text(s));
    }
    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "patch has no updatable fields", None);
    }
    // An edited placeholder is a real student from now on.
    set_parts.push("placeholder = 0".into());

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Integer(student_id));
    match conn.execute(&sql, params_from_iter(bind_values.iter())) {
        Ok(0) => err(
            &req.id,
            "not_found",
            format!("Student with ID {} does not exist", student_id),
            None,
        ),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        ),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_i64(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let removed_marks = match tx.execute("DELETE FROM student_marks WHERE student_id = ?", [student_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "student_marks" })),
            );
        }
    };

    match tx.execute("DELETE FROM students WHERE id = ?", [student_id]) {
        Ok(0) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "not_found",
                format!("Student with ID {} does not exist", student_id),
                None,
            );
        }
        Ok(_) => {}
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(student_id, removed_marks, "student deleted");
    ok(&req.id, json!({ "ok": true, "removedMarks": removed_marks }))
}

fn handle_students_count(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get::<_, i64>(0)) {
        Ok(count) => ok(&req.id, json!({ "count": count })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.count" => Some(handle_students_count(state, req)),
        _ => None,
    }
}
