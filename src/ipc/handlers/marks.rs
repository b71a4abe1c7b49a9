use crate::calc::{
    self, GradingError, MarksRecord, RosterStudent, SubjectMarks, SubmissionDecision, TotalMode,
    SUBJECT_KEYS,
};
use crate::db::{self, RosterScope};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::load_grading_settings;
use crate::ipc::helpers::{
    db_conn, db_conn_mut, grading_err, grading_item_error, item_error, optional_date, record_json,
    required_i64, required_str, today,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, TransactionBehavior};
use serde_json::{json, Map};
use std::collections::HashMap;

/// Request field names used by `marks.update`, in subject order.
const EDIT_FIELDS: [&str; 5] = [
    "mathMarks",
    "englishMarks",
    "kiswahiliMarks",
    "scienceMarks",
    "sstMarks",
];

enum SubmitFailure {
    Rejected(GradingError),
    Db {
        code: &'static str,
        error: anyhow::Error,
    },
}

impl From<GradingError> for SubmitFailure {
    fn from(e: GradingError) -> Self {
        Self::Rejected(e)
    }
}

fn db_failure(code: &'static str) -> impl Fn(anyhow::Error) -> SubmitFailure {
    move |error| SubmitFailure::Db { code, error }
}

struct Submitted {
    student: RosterStudent,
    record: MarksRecord,
}

/// Gate check and insert for one student under a write lock.
///
/// `provision_class` allows an unknown student id to be created as a
/// placeholder in that class; the placeholder rolls back with the record.
fn submit_one(
    conn: &mut Connection,
    student_id: i64,
    marks: SubjectMarks,
    total_marks: i64,
    submission_date: NaiveDate,
    provision_class: Option<&str>,
) -> Result<Submitted, SubmitFailure> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| SubmitFailure::Db {
            code: "db_tx_failed",
            error: e.into(),
        })?;

    let student = match db::student_by_id(&tx, student_id).map_err(db_failure("db_query_failed"))? {
        Some(s) => s,
        None => match provision_class {
            Some(class_name) => {
                let s = db::insert_placeholder_student(&tx, student_id, class_name)
                    .map_err(db_failure("db_insert_failed"))?;
                tracing::info!(student_id, class_name, "placeholder student provisioned");
                s
            }
            None => return Err(GradingError::unknown_student(student_id).into()),
        },
    };

    let previous =
        db::latest_submission_date(&tx, student_id).map_err(db_failure("db_query_failed"))?;
    calc::gate_submission(student_id, previous, submission_date)?;

    let record_id =
        db::insert_marks_record(&tx, student_id, &marks, total_marks, submission_date)
            .map_err(db_failure("db_insert_failed"))?;
    tx.commit().map_err(|e| SubmitFailure::Db {
        code: "db_commit_failed",
        error: e.into(),
    })?;

    Ok(Submitted {
        student,
        record: MarksRecord {
            id: record_id,
            student_id,
            marks,
            total_marks,
            submission_date,
        },
    })
}

fn failure_entry(student_id: i64, failure: &SubmitFailure) -> serde_json::Value {
    match failure {
        SubmitFailure::Rejected(e) => {
            if let GradingError::Cooldown { days_remaining, .. } = e {
                tracing::info!(student_id, days_remaining, "submission refused by cooldown");
            }
            grading_item_error(e)
        }
        SubmitFailure::Db { code, error } => {
            tracing::warn!(student_id, code, error = %error, "submission failed");
            item_error(Some(student_id), code, error.to_string(), None)
        }
    }
}

fn handle_marks_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(items) = req.params.get("marks").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "marks must be an array", None);
    };
    if items.is_empty() {
        return err(&req.id, "bad_params", "marks must not be empty", None);
    }
    let batch_class = req
        .params
        .get("className")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let submission_date = match optional_date(req, "submissionDate") {
        Ok(d) => d.unwrap_or_else(today),
        Err(e) => return e,
    };
    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let settings = match load_grading_settings(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let provision_class = if settings.auto_provision_students {
        Some(
            batch_class
                .clone()
                .unwrap_or_else(|| settings.placeholder_class_name.clone()),
        )
    } else {
        None
    };

    let mut submitted = Vec::new();
    let mut errors = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let Some(student_id) = item.get("id").and_then(|v| v.as_i64()) else {
            errors.push(item_error(
                None,
                "bad_params",
                format!("marks[{}]: missing or non-integer id", idx),
                None,
            ));
            continue;
        };
        let marks = match calc::parse_subject_marks(
            item.get("subjectMarks"),
            settings.missing_subjects,
            Some(student_id),
        ) {
            Ok(m) => m,
            Err(e) => {
                errors.push(grading_item_error(&e));
                continue;
            }
        };
        // A client-supplied total is never trusted on submission.
        let total = calc::resolve_total(
            &marks,
            item.get("totalMarks").and_then(|v| v.as_i64()),
            TotalMode::Recompute,
        );

        match submit_one(
            conn,
            student_id,
            marks,
            total,
            submission_date,
            provision_class.as_deref(),
        ) {
            Ok(done) => submitted.push(json!({
                "id": student_id,
                "name": done.student.display_name(),
                "recordId": done.record.id,
                "totalMarks": done.record.total_marks,
            })),
            Err(failure) => errors.push(failure_entry(student_id, &failure)),
        }
    }

    let (status, detail) = match (submitted.len(), errors.len()) {
        (n, 0) => ("all_submitted", format!("Marks submitted for {} student(s)", n)),
        (0, _) => ("all_failed", "No marks were submitted".to_string()),
        (n, k) => (
            "partial",
            format!("Marks submitted for {} student(s); {} failed", n, k),
        ),
    };
    tracing::info!(
        submitted = submitted.len(),
        failed = errors.len(),
        status,
        date = %submission_date,
        "marks batch processed"
    );

    ok(
        &req.id,
        json!({
            "status": status,
            "detail": detail,
            "submitted": submitted,
            "errors": errors,
        }),
    )
}

fn student_json(s: &RosterStudent) -> serde_json::Value {
    json!({
        "id": s.id,
        "firstName": s.first_name,
        "lastName": s.last_name,
        "displayName": s.display_name(),
        "className": s.class_name,
    })
}

fn graded_record_json(r: &MarksRecord) -> serde_json::Value {
    let mut v = record_json(r);
    let average = calc::compute_average(&r.marks);
    v["average"] = json!(calc::round_2_decimals(average));
    v["avgGrade"] = json!(calc::band(average));
    v
}

fn handle_marks_list_by_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_i64(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student = match db::student_by_id(conn, student_id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("Student with ID {} does not exist", student_id),
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let history = match db::records_for_student(conn, student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if history.is_empty() {
        return err(
            &req.id,
            "not_found",
            format!("No marks found for student {}", student_id),
            None,
        );
    }

    ok(
        &req.id,
        json!({
            "student": student_json(&student),
            "marks": history.iter().map(graded_record_json).collect::<Vec<_>>(),
        }),
    )
}

fn handle_marks_list_by_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let roster = match db::roster(conn, &RosterScope::Class(class_name.clone())) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if roster.is_empty() {
        return err(
            &req.id,
            "not_found",
            "No students found in this class",
            Some(json!({ "className": class_name })),
        );
    }
    let ids: Vec<i64> = roster.iter().map(|s| s.id).collect();
    let records = match db::records_for(conn, &ids) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let latest = calc::current_records(&records);

    let students: Vec<serde_json::Value> = roster
        .iter()
        .map(|s| {
            json!({
                "student": student_json(s),
                "latestMarks": latest.get(&s.id).map(|r| graded_record_json(r)),
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "className": class_name,
            "students": students,
        }),
    )
}

fn handle_marks_list_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let records = match db::all_records(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = match db::roster(conn, &RosterScope::All) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let by_id: HashMap<i64, &RosterStudent> = roster.iter().map(|s| (s.id, s)).collect();

    let marks: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            let student = by_id.get(&r.student_id);
            let mut v = graded_record_json(r);
            v["studentExists"] = json!(student.is_some());
            v["studentName"] = json!(student.map(|s| s.display_name()));
            v["className"] = json!(student.map(|s| s.class_name.clone()));
            v
        })
        .collect();

    ok(&req.id, json!({ "marks": marks }))
}

/// Maps `marks.update` field names onto submission subject keys.
fn edit_fields_as_subject_marks(req: &Request) -> serde_json::Value {
    let mut obj = Map::new();
    for (field, key) in EDIT_FIELDS.iter().zip(SUBJECT_KEYS.iter()) {
        if let Some(v) = req.params.get(*field) {
            obj.insert((*key).to_string(), v.clone());
        }
    }
    serde_json::Value::Object(obj)
}

fn edit_existing(
    conn: &Connection,
    req: &Request,
    student_id: i64,
    record_id: i64,
) -> serde_json::Value {
    let existing = match db::record_by_id(conn, record_id) {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("Marks record {} does not exist", record_id),
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.student_id != student_id {
        return err(
            &req.id,
            "bad_params",
            format!(
                "Marks record {} does not belong to student {}",
                record_id, student_id
            ),
            None,
        );
    }

    let mut values = existing.marks.as_array();
    for (i, field) in EDIT_FIELDS.iter().enumerate() {
        match req.params.get(*field) {
            None => {}
            Some(v) if v.is_null() => {}
            Some(v) => match calc::parse_mark_value(v, field, Some(student_id)) {
                Ok(n) => values[i] = n,
                Err(e) => return grading_err(req, &e),
            },
        }
    }
    let marks = SubjectMarks::new(values[0], values[1], values[2], values[3], values[4]);
    if let Err(e) = calc::ensure_total_fits(&marks, Some(student_id)) {
        return grading_err(req, &e);
    }
    let total = calc::resolve_total(
        &marks,
        req.params.get("totalMarks").and_then(|v| v.as_i64()),
        TotalMode::TrustSupplied,
    );

    if let Err(e) = db::update_marks_record(conn, record_id, &marks, total) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "student_marks" })),
        );
    }
    let updated = MarksRecord {
        marks,
        total_marks: total,
        ..existing
    };
    ok(
        &req.id,
        json!({ "created": false, "record": graded_record_json(&updated) }),
    )
}

fn handle_marks_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match required_i64(req, "student") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let record_id = match req.params.get("id") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_i64() {
            Some(id) => Some(id),
            None => return err(&req.id, "bad_params", "id must be an integer", None),
        },
    };
    let submission_date = match optional_date(req, "submissionDate") {
        Ok(d) => d.unwrap_or_else(today),
        Err(e) => return e,
    };
    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    if let Some(record_id) = record_id {
        return edit_existing(conn, req, student_id, record_id);
    }

    // No record id: this is a fresh submission for one student.
    let settings = match load_grading_settings(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let raw = edit_fields_as_subject_marks(req);
    let marks = match calc::parse_subject_marks(Some(&raw), settings.missing_subjects, Some(student_id))
    {
        Ok(m) => m,
        Err(e) => return grading_err(req, &e),
    };
    let total = calc::resolve_total(
        &marks,
        req.params.get("totalMarks").and_then(|v| v.as_i64()),
        TotalMode::TrustSupplied,
    );

    match submit_one(conn, student_id, marks, total, submission_date, None) {
        Ok(done) => ok(
            &req.id,
            json!({ "created": true, "record": graded_record_json(&done.record) }),
        ),
        Err(SubmitFailure::Rejected(e)) => {
            if let GradingError::Cooldown { days_remaining, .. } = &e {
                tracing::info!(student_id, days_remaining, "submission refused by cooldown");
            }
            grading_err(req, &e)
        }
        Err(SubmitFailure::Db { code, error }) => err(&req.id, code, error.to_string(), None),
    }
}

fn handle_grading_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_i64(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let as_of = match optional_date(req, "today") {
        Ok(d) => d.unwrap_or_else(today),
        Err(e) => return e,
    };

    match db::student_by_id(conn, student_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("Student with ID {} does not exist", student_id),
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let previous = match db::latest_submission_date(conn, student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let next_allowed = previous.and_then(calc::next_allowed_date);
    let fmt = |d: NaiveDate| d.format("%Y-%m-%d").to_string();
    let mut result = json!({
        "studentId": student_id,
        "today": fmt(as_of),
        "lastSubmission": previous.map(fmt),
        "nextAllowedDate": next_allowed.map(fmt),
    });
    match calc::check_submission(previous, as_of) {
        SubmissionDecision::Allow => {
            result["allowed"] = json!(true);
        }
        SubmissionDecision::Deny {
            days_elapsed,
            days_remaining,
        } => {
            result["allowed"] = json!(false);
            result["daysElapsed"] = json!(days_elapsed);
            result["daysRemaining"] = json!(days_remaining);
            if let Err(e) = calc::gate_submission(student_id, previous, as_of) {
                result["message"] = json!(e.message());
            }
        }
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.submit" => Some(handle_marks_submit(state, req)),
        "marks.listByStudent" => Some(handle_marks_list_by_student(state, req)),
        "marks.listByClass" => Some(handle_marks_list_by_class(state, req)),
        "marks.listAll" => Some(handle_marks_list_all(state, req)),
        "marks.update" => Some(handle_marks_update(state, req)),
        "grading.check" => Some(handle_grading_check(state, req)),
        _ => None,
    }
}
