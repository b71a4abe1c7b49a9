use crate::calc::{self, RankedResult, RosterStudent};
use crate::db::{self, RosterScope};
use anyhow::{anyhow, Context};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const REPORTS_DIR: &str = "reports";

#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn db(e: anyhow::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportScope {
    All,
    Class(String),
    Student(i64),
}

impl ReportScope {
    pub fn parse(params: &serde_json::Value) -> Result<Self, ReportError> {
        let report_type = params
            .get("reportType")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "all".to_string());
        match report_type.as_str() {
            "all" => Ok(Self::All),
            "class" => {
                let class_name = params
                    .get("className")
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                if class_name.is_empty() {
                    return Err(ReportError::new(
                        "bad_params",
                        "className is required for class reports",
                    ));
                }
                Ok(Self::Class(class_name))
            }
            "student" => match params.get("studentId").and_then(|v| v.as_i64()) {
                Some(id) => Ok(Self::Student(id)),
                None => Err(ReportError::new(
                    "bad_params",
                    "studentId is required for student reports",
                )),
            },
            _ => Err(ReportError::new(
                "bad_params",
                "reportType must be one of: all, class, student",
            )),
        }
    }

    pub fn report_type(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Class(_) => "class",
            Self::Student(_) => "student",
        }
    }

    pub fn class_name(&self) -> Option<&str> {
        match self {
            Self::Class(name) => Some(name),
            _ => None,
        }
    }

    pub fn student_id(&self) -> Option<i64> {
        match self {
            Self::Student(id) => Some(*id),
            _ => None,
        }
    }

    pub fn file_stem(&self) -> String {
        match self {
            Self::All => "all_students_report".to_string(),
            Self::Class(name) => format!("class_{}_report", sanitize_file_component(name)),
            Self::Student(id) => format!("student_{}_report", id),
        }
    }
}

fn sanitize_file_component(s: &str) -> String {
    let out: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "unnamed".to_string()
    } else {
        out
    }
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub include_unmarked_students: bool,
    pub school_name: String,
    pub show_generated_at: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            include_unmarked_students: true,
            school_name: String::new(),
            show_generated_at: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGroup {
    pub class_name: String,
    pub student_count: usize,
    pub class_average: f64,
    pub results: Vec<RankedResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsReport {
    pub title: String,
    pub report_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub school_name: Option<String>,
    pub generated_at: String,
    pub show_generated_at: bool,
    pub class_groups: Vec<ClassGroup>,
    pub unmatched_student_ids: Vec<i64>,
}

pub fn build_results_report(
    conn: &Connection,
    scope: &ReportScope,
    opts: &ReportOptions,
    generated_at: NaiveDateTime,
) -> Result<ResultsReport, ReportError> {
    let (title, roster_scope, only_student): (String, RosterScope, Option<i64>) = match scope {
        ReportScope::All => ("Student Results Report".to_string(), RosterScope::All, None),
        ReportScope::Class(name) => (
            format!("Results Report for Class {}", name),
            RosterScope::Class(name.clone()),
            None,
        ),
        ReportScope::Student(id) => {
            let student = db::student_by_id(conn, *id)
                .map_err(ReportError::db)?
                .ok_or_else(|| {
                    ReportError::new("not_found", format!("Student with ID {} does not exist", id))
                })?;
            // Rank inside the whole class so the position means something.
            (
                format!("Results Report for {}", student.display_name()),
                RosterScope::Class(student.class_name.clone()),
                Some(*id),
            )
        }
    };

    let mut roster: Vec<RosterStudent> = db::roster(conn, &roster_scope).map_err(ReportError::db)?;
    if roster.is_empty() {
        if let ReportScope::Class(_) = scope {
            return Err(ReportError::new(
                "not_found",
                "No students found in this class",
            ));
        }
    }

    let ids: Vec<i64> = roster.iter().map(|s| s.id).collect();
    let records = db::records_for(conn, &ids).map_err(ReportError::db)?;
    if !opts.include_unmarked_students {
        let marked: std::collections::HashSet<i64> =
            records.iter().map(|r| r.student_id).collect();
        roster.retain(|s| marked.contains(&s.id));
    }

    let ranking = calc::rank_class(&roster, &records);
    let class_groups = ranking
        .classes
        .into_iter()
        .map(|(class_name, mut results)| {
            let class_average = calc::class_average(&results);
            let student_count = results.len();
            if let Some(id) = only_student {
                results.retain(|r| r.student_id == id);
            }
            ClassGroup {
                class_name,
                student_count,
                class_average,
                results,
            }
        })
        .filter(|g| !g.results.is_empty())
        .collect();

    let school_name = opts.school_name.trim();
    Ok(ResultsReport {
        title,
        report_type: scope.report_type().to_string(),
        school_name: if school_name.is_empty() {
            None
        } else {
            Some(school_name.to_string())
        },
        generated_at: generated_at.format("%Y-%m-%d %H:%M").to_string(),
        show_generated_at: opts.show_generated_at,
        class_groups,
        unmatched_student_ids: ranking.unmatched_student_ids,
    })
}

#[derive(Debug, Clone)]
pub struct SavedReportFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Writes `<workspace>/reports/<stem>_<YYYYMMDD_HHMMSS>.pdf`, suffixing `_N`
/// when a report with the same stamp already exists.
pub fn save_report_file(
    workspace: &Path,
    stem: &str,
    bytes: &[u8],
    generated_at: NaiveDateTime,
) -> anyhow::Result<SavedReportFile> {
    let dir = workspace.join(REPORTS_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.to_string_lossy()))?;

    let base = format!("{}_{}", stem, generated_at.format("%Y%m%d_%H%M%S"));
    let mut file_name = format!("{}.pdf", base);
    let mut n = 1;
    while dir.join(&file_name).exists() {
        file_name = format!("{}_{}.pdf", base, n);
        n += 1;
        if n > 10_000 {
            return Err(anyhow!("no free report file name for {}", base));
        }
    }

    let absolute_path = dir.join(&file_name);
    std::fs::write(&absolute_path, bytes).with_context(|| {
        format!(
            "failed to write report file {}",
            absolute_path.to_string_lossy()
        )
    })?;

    Ok(SavedReportFile {
        relative_path: format!("{}/{}", REPORTS_DIR, file_name),
        absolute_path,
        sha256: sha256_hex(bytes),
        size_bytes: bytes.len() as u64,
    })
}

/// Resolves a stored relative report path, refusing anything that escapes the
/// workspace reports directory.
pub fn resolve_report_path(workspace: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return None;
    }
    if rel.components().next().map(|c| c.as_os_str()) != Some(std::ffi::OsStr::new(REPORTS_DIR)) {
        return None;
    }
    Some(workspace.join(rel))
}
