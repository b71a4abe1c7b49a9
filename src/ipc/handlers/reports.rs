use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::load_report_options;
use crate::ipc::helpers::{db_conn, required_str, workspace_path};
use crate::ipc::types::{AppState, Request};
use crate::pdf;
use crate::report::{self, ReportError, ReportScope, ResultsReport};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn report_err(req: &Request, e: ReportError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, None)
}

fn build_model(
    conn: &Connection,
    req: &Request,
    generated_at: chrono::NaiveDateTime,
) -> Result<(ReportScope, ResultsReport), serde_json::Value> {
    let scope = ReportScope::parse(&req.params).map_err(|e| report_err(req, e))?;
    let opts = load_report_options(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let model = report::build_results_report(conn, &scope, &opts, generated_at)
        .map_err(|e| report_err(req, e))?;
    Ok((scope, model))
}

fn handle_reports_results_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let now = chrono::Local::now().naive_local();
    match build_model(conn, req, now) {
        Ok((_, model)) => ok(&req.id, json!(model)),
        Err(e) => e,
    }
}

fn handle_reports_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let workspace = match workspace_path(state, req) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let generated_by = req
        .params
        .get("generatedBy")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let now = chrono::Local::now().naive_local();
    let (scope, model) = match build_model(conn, req, now) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let bytes = pdf::render_results_pdf(&model);
    let saved = match report::save_report_file(workspace, &scope.file_stem(), &bytes, now) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "report file write failed");
            return err(&req.id, "io_failed", format!("{e:#}"), None);
        }
    };

    let report_id = Uuid::new_v4().to_string();
    let generated_at = now.format("%Y-%m-%dT%H:%M:%S").to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO reports(id, report_type, class_name, student_id, generated_at, generated_by, download_count, file_path, sha256)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &report_id,
            scope.report_type(),
            scope.class_name(),
            scope.student_id(),
            &generated_at,
            generated_by.as_deref(),
            &saved.relative_path,
            &saved.sha256,
        ),
    ) {
        // An unrecorded file would never show up in reports.list.
        let _ = std::fs::remove_file(&saved.absolute_path);
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "reports" })),
        );
    }

    tracing::info!(
        report_id = %report_id,
        report_type = scope.report_type(),
        path = %saved.relative_path,
        size = saved.size_bytes,
        "report generated"
    );
    ok(
        &req.id,
        json!({
            "reportId": report_id,
            "reportType": scope.report_type(),
            "title": model.title,
            "generatedAt": generated_at,
            "filePath": saved.relative_path,
            "absolutePath": saved.absolute_path.to_string_lossy(),
            "sha256": saved.sha256,
            "sizeBytes": saved.size_bytes,
        }),
    )
}

fn report_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let report_type: String = row.get(1)?;
    let class_name: Option<String> = row.get(2)?;
    let student_id: Option<i64> = row.get(3)?;
    let generated_at: String = row.get(4)?;
    let generated_by: Option<String> = row.get(5)?;
    let download_count: i64 = row.get(6)?;
    let file_path: Option<String> = row.get(7)?;
    let sha256: Option<String> = row.get(8)?;
    Ok(json!({
        "id": id,
        "reportType": report_type,
        "className": class_name,
        "studentId": student_id,
        "generatedAt": generated_at,
        "generatedBy": generated_by,
        "downloadCount": download_count,
        "filePath": file_path,
        "sha256": sha256
    }))
}

const REPORT_COLUMNS: &str = "id, report_type, class_name, student_id, generated_at, generated_by, download_count, file_path, sha256";

fn handle_reports_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let sql = format!(
        "SELECT {} FROM reports ORDER BY generated_at DESC, rowid DESC",
        REPORT_COLUMNS
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], report_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(reports) => ok(&req.id, json!({ "reports": reports })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_reports_download(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let workspace = match workspace_path(state, req) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let report_id = match required_str(req, "reportId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT file_path, sha256 FROM reports WHERE id = ?",
            [&report_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((file_path, expected_sha)) = row else {
        return err(&req.id, "not_found", "Report not found", None);
    };
    let Some(absolute) = file_path
        .as_deref()
        .and_then(|p| report::resolve_report_path(workspace, p))
    else {
        return err(
            &req.id,
            "not_found",
            "Report file not found",
            Some(json!({ "reportId": report_id })),
        );
    };
    let bytes = match std::fs::read(&absolute) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(report_id = %report_id, error = %e, "report file missing");
            return err(
                &req.id,
                "not_found",
                "Report file not found",
                Some(json!({ "reportId": report_id, "filePath": file_path })),
            );
        }
    };

    let actual_sha = report::sha256_hex(&bytes);
    // Rows written before checksums were recorded have nothing to verify against.
    let verified = expected_sha.as_deref().map(|s| s == actual_sha);
    if verified == Some(false) {
        tracing::warn!(report_id = %report_id, "report file checksum mismatch");
    }

    let download_count: i64 = match conn.query_row(
        "UPDATE reports SET download_count = download_count + 1 WHERE id = ? RETURNING download_count",
        [&report_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "reports" })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "reportId": report_id,
            "filePath": file_path,
            "absolutePath": absolute.to_string_lossy(),
            "sizeBytes": bytes.len(),
            "sha256": actual_sha,
            "verified": verified,
            "downloadCount": download_count,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.resultsModel" => Some(handle_reports_results_model(state, req)),
        "reports.generate" => Some(handle_reports_generate(state, req)),
        "reports.list" => Some(handle_reports_list(state, req)),
        "reports.download" => Some(handle_reports_download(state, req)),
        _ => None,
    }
}
