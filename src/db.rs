use crate::calc::{MarksRecord, RosterStudent, SubjectMarks};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            class_name TEXT NOT NULL UNIQUE,
            class_teacher TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;
    // Workspaces created before auto-provisioning existed lack the flag.
    ensure_students_placeholder(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_marks(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            math INTEGER NOT NULL,
            eng INTEGER NOT NULL,
            kis INTEGER NOT NULL,
            sci INTEGER NOT NULL,
            sst INTEGER NOT NULL,
            total_marks INTEGER NOT NULL,
            submission_date TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_marks_student_date
         ON student_marks(student_id, submission_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reports(
            id TEXT PRIMARY KEY,
            report_type TEXT NOT NULL,
            class_name TEXT,
            student_id INTEGER,
            generated_at TEXT NOT NULL,
            generated_by TEXT,
            download_count INTEGER NOT NULL DEFAULT 0,
            file_path TEXT
        )",
        [],
    )?;
    ensure_reports_sha256(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_generated_at ON reports(generated_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_placeholder(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "placeholder")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN placeholder INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_reports_sha256(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "reports", "sha256")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE reports ADD COLUMN sha256 TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    // A corrupt value reads as unset rather than failing the caller.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterScope {
    All,
    Class(String),
}

fn roster_row(r: &Row<'_>) -> rusqlite::Result<RosterStudent> {
    Ok(RosterStudent {
        id: r.get(0)?,
        first_name: r.get(1)?,
        last_name: r.get(2)?,
        class_name: r.get(3)?,
    })
}

/// Roster in report order: by class, then first and last name.
pub fn roster(conn: &Connection, scope: &RosterScope) -> anyhow::Result<Vec<RosterStudent>> {
    let students = match scope {
        RosterScope::All => {
            let mut stmt = conn.prepare(
                "SELECT id, first_name, last_name, class_name
                 FROM students
                 ORDER BY class_name, first_name, last_name, id",
            )?;
            let rows = stmt
                .query_map([], roster_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        RosterScope::Class(class_name) => {
            let mut stmt = conn.prepare(
                "SELECT id, first_name, last_name, class_name
                 FROM students
                 WHERE class_name = ?
                 ORDER BY first_name, last_name, id",
            )?;
            let rows = stmt
                .query_map([class_name], roster_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(students)
}

pub fn student_by_id(conn: &Connection, student_id: i64) -> anyhow::Result<Option<RosterStudent>> {
    Ok(conn
        .query_row(
            "SELECT id, first_name, last_name, class_name FROM students WHERE id = ?",
            [student_id],
            roster_row,
        )
        .optional()?)
}

pub fn insert_placeholder_student(
    conn: &Connection,
    student_id: i64,
    class_name: &str,
) -> anyhow::Result<RosterStudent> {
    let student = RosterStudent {
        id: student_id,
        first_name: "Student".to_string(),
        last_name: student_id.to_string(),
        class_name: class_name.to_string(),
    };
    conn.execute(
        "INSERT INTO students(id, first_name, last_name, class_name, placeholder, created_at)
         VALUES(?, ?, ?, ?, 1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            student.id,
            &student.first_name,
            &student.last_name,
            &student.class_name,
        ),
    )?;
    Ok(student)
}

fn marks_record_row(r: &Row<'_>) -> rusqlite::Result<MarksRecord> {
    Ok(MarksRecord {
        id: r.get(0)?,
        student_id: r.get(1)?,
        marks: SubjectMarks::new(r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?),
        total_marks: r.get(7)?,
        submission_date: r.get(8)?,
    })
}

const MARKS_COLUMNS: &str =
    "id, student_id, math, eng, kis, sci, sst, total_marks, submission_date";

pub fn latest_submission_date(conn: &Connection, student_id: i64) -> anyhow::Result<Option<NaiveDate>> {
    Ok(conn
        .query_row(
            "SELECT submission_date FROM student_marks
             WHERE student_id = ?
             ORDER BY submission_date DESC, id DESC
             LIMIT 1",
            [student_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Full history for one student, newest first.
pub fn records_for_student(conn: &Connection, student_id: i64) -> anyhow::Result<Vec<MarksRecord>> {
    let sql = format!(
        "SELECT {} FROM student_marks
         WHERE student_id = ?
         ORDER BY submission_date DESC, id DESC",
        MARKS_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([student_id], marks_record_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn records_for(conn: &Connection, student_ids: &[i64]) -> anyhow::Result<Vec<MarksRecord>> {
    if student_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat("?")
        .take(student_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT {} FROM student_marks
         WHERE student_id IN ({})
         ORDER BY submission_date DESC, id DESC",
        MARKS_COLUMNS, placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(student_ids.iter()), marks_record_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn all_records(conn: &Connection) -> anyhow::Result<Vec<MarksRecord>> {
    let sql = format!(
        "SELECT {} FROM student_marks ORDER BY submission_date DESC, id DESC",
        MARKS_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], marks_record_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn record_by_id(conn: &Connection, record_id: i64) -> anyhow::Result<Option<MarksRecord>> {
    let sql = format!("SELECT {} FROM student_marks WHERE id = ?", MARKS_COLUMNS);
    Ok(conn.query_row(&sql, [record_id], marks_record_row).optional()?)
}

pub fn insert_marks_record(
    conn: &Connection,
    student_id: i64,
    marks: &SubjectMarks,
    total_marks: i64,
    submission_date: NaiveDate,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO student_marks(student_id, math, eng, kis, sci, sst, total_marks, submission_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            student_id,
            marks.math,
            marks.eng,
            marks.kis,
            marks.sci,
            marks.sst,
            total_marks,
            submission_date,
        ),
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_marks_record(
    conn: &Connection,
    record_id: i64,
    marks: &SubjectMarks,
    total_marks: i64,
) -> anyhow::Result<usize> {
    Ok(conn.execute(
        "UPDATE student_marks
         SET math = ?, eng = ?, kis = ?, sci = ?, sst = ?, total_marks = ?
         WHERE id = ?",
        (
            marks.math,
            marks.eng,
            marks.kis,
            marks.sci,
            marks.sst,
            total_marks,
            record_id,
        ),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn migrates_workspace_without_placeholder_or_sha_columns() {
        let workspace = temp_dir("gradebook-db-migrate");
        {
            let conn = Connection::open(workspace.join(DB_FILE_NAME)).expect("open raw db");
            conn.execute_batch(
                "CREATE TABLE students(
                    id INTEGER PRIMARY KEY,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    class_name TEXT NOT NULL,
                    created_at TEXT
                 );
                 INSERT INTO students(id, first_name, last_name, class_name) VALUES(1, 'Old', 'Row', '4A');
                 CREATE TABLE reports(
                    id TEXT PRIMARY KEY,
                    report_type TEXT NOT NULL,
                    class_name TEXT,
                    student_id INTEGER,
                    generated_at TEXT NOT NULL,
                    generated_by TEXT,
                    download_count INTEGER NOT NULL DEFAULT 0,
                    file_path TEXT
                 );",
            )
            .expect("seed pre-migration schema");
        }

        let conn = open_db(&workspace).expect("open_db migrates");
        assert!(table_has_column(&conn, "students", "placeholder").expect("pragma"));
        assert!(table_has_column(&conn, "reports", "sha256").expect("pragma"));
        let placeholder: i64 = conn
            .query_row("SELECT placeholder FROM students WHERE id = 1", [], |r| r.get(0))
            .expect("row");
        assert_eq!(placeholder, 0);

        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn latest_submission_prefers_newest_date_then_newest_id() {
        let workspace = temp_dir("gradebook-db-latest");
        let conn = open_db(&workspace).expect("open db");
        insert_placeholder_student(&conn, 7, "4A").expect("student");
        let m = SubjectMarks::new(1, 2, 3, 4, 5);
        assert_eq!(latest_submission_date(&conn, 7).expect("query"), None);

        insert_marks_record(&conn, 7, &m, 15, date("2024-02-01")).expect("insert");
        let newest = insert_marks_record(&conn, 7, &m, 15, date("2024-03-01")).expect("insert");
        insert_marks_record(&conn, 7, &m, 15, date("2024-01-01")).expect("insert");

        assert_eq!(
            latest_submission_date(&conn, 7).expect("query"),
            Some(date("2024-03-01"))
        );
        let history = records_for_student(&conn, 7).expect("history");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, newest);
        assert_eq!(history[2].submission_date, date("2024-01-01"));

        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn settings_roundtrip_and_corrupt_values_read_as_unset() {
        let workspace = temp_dir("gradebook-db-settings");
        let conn = open_db(&workspace).expect("open db");
        settings_set_json(&conn, "setup.grading", &serde_json::json!({ "a": 1 })).expect("set");
        assert_eq!(
            settings_get_json(&conn, "setup.grading").expect("get"),
            Some(serde_json::json!({ "a": 1 }))
        );
        conn.execute(
            "UPDATE settings SET value_json = '{not json' WHERE key = 'setup.grading'",
            [],
        )
        .expect("corrupt");
        assert_eq!(settings_get_json(&conn, "setup.grading").expect("get"), None);

        let _ = std::fs::remove_dir_all(workspace);
    }
}
