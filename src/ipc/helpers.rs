use crate::calc::{GradingError, MarksRecord};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use std::path::Path;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn db_conn_mut<'a>(
    state: &'a mut AppState,
    req: &Request,
) -> Result<&'a mut Connection, serde_json::Value> {
    state
        .db
        .as_mut()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn workspace_path<'a>(state: &'a AppState, req: &Request) -> Result<&'a Path, serde_json::Value> {
    state
        .workspace
        .as_deref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Non-empty, trimmed string param.
pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()).map(|s| s.trim()) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        )),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("missing or non-integer {}", key),
                None,
            )
        })
}

pub fn optional_date(req: &Request, key: &str) -> Result<Option<NaiveDate>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let parsed = v
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok());
            match parsed {
                Some(d) => Ok(Some(d)),
                None => Err(err(
                    &req.id,
                    "bad_params",
                    format!("{} must be a YYYY-MM-DD date", key),
                    None,
                )),
            }
        }
    }
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn grading_err(req: &Request, e: &GradingError) -> serde_json::Value {
    err(&req.id, e.code(), e.message(), e.details())
}

/// Error entry for one item of a batch.
pub fn item_error(
    id: Option<i64>,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut entry = json!({
        "id": id,
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        entry["details"] = d;
    }
    entry
}

pub fn grading_item_error(e: &GradingError) -> serde_json::Value {
    item_error(e.student_id(), e.code(), e.message(), e.details())
}

pub fn record_json(r: &MarksRecord) -> serde_json::Value {
    json!({
        "id": r.id,
        "student": r.student_id,
        "mathMarks": r.marks.math,
        "englishMarks": r.marks.eng,
        "kiswahiliMarks": r.marks.kis,
        "scienceMarks": r.marks.sci,
        "sstMarks": r.marks.sst,
        "totalMarks": r.total_marks,
        "submissionDate": r.submission_date.format("%Y-%m-%d").to_string(),
    })
}
