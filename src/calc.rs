use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Minimum number of whole days between two marks submissions for one student.
pub const SUBMISSION_COOLDOWN_DAYS: i64 = 7;

/// Wire keys for the five subjects, in report column order.
pub const SUBJECT_KEYS: [&str; 5] = ["Math", "Eng", "Kis", "Sci", "SST"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Band {
    #[serde(rename = "B.E")]
    BelowExpectations,
    #[serde(rename = "A.E")]
    ApproachingExpectations,
    #[serde(rename = "M.E")]
    MeetingExpectations,
    #[serde(rename = "E.E")]
    ExceedingExpectations,
}

impl Band {
    pub fn label(self) -> &'static str {
        match self {
            Band::ExceedingExpectations => "E.E",
            Band::MeetingExpectations => "M.E",
            Band::ApproachingExpectations => "A.E",
            Band::BelowExpectations => "B.E",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inclusive lower thresholds at 70/60/40. NaN falls through to B.E.
pub fn band(mark: f64) -> Band {
    if mark >= 70.0 {
        Band::ExceedingExpectations
    } else if mark >= 60.0 {
        Band::MeetingExpectations
    } else if mark >= 40.0 {
        Band::ApproachingExpectations
    } else {
        Band::BelowExpectations
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMarks {
    pub math: i64,
    pub eng: i64,
    pub kis: i64,
    pub sci: i64,
    pub sst: i64,
}

impl SubjectMarks {
    pub fn new(math: i64, eng: i64, kis: i64, sci: i64, sst: i64) -> Self {
        Self {
            math,
            eng,
            kis,
            sci,
            sst,
        }
    }

    pub fn as_array(&self) -> [i64; 5] {
        [self.math, self.eng, self.kis, self.sci, self.sst]
    }

    fn from_array(v: [i64; 5]) -> Self {
        Self::new(v[0], v[1], v[2], v[3], v[4])
    }
}

/// Saturates instead of wrapping; inputs are bounded by `checked_total` at parse time.
pub fn compute_total(marks: &SubjectMarks) -> i64 {
    marks
        .as_array()
        .iter()
        .fold(0_i64, |acc, m| acc.saturating_add(*m))
}

pub fn checked_total(marks: &SubjectMarks) -> Option<i64> {
    marks
        .as_array()
        .iter()
        .try_fold(0_i64, |acc, m| acc.checked_add(*m))
}

pub fn ensure_total_fits(marks: &SubjectMarks, student_id: Option<i64>) -> Result<i64, GradingError> {
    checked_total(marks).ok_or_else(|| {
        GradingError::validation("bad_params", student_id, "subject marks are too large to total")
    })
}

pub fn compute_average(marks: &SubjectMarks) -> f64 {
    compute_total(marks) as f64 / SUBJECT_KEYS.len() as f64
}

/// Display rounding only; ranking never sees the rounded value.
pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalMode {
    /// Interactive edits: a caller-supplied non-zero total wins over the sum.
    TrustSupplied,
    /// Grade submission: the sum of the subjects is authoritative.
    Recompute,
}

pub fn resolve_total(marks: &SubjectMarks, supplied: Option<i64>, mode: TotalMode) -> i64 {
    match (mode, supplied) {
        (TotalMode::TrustSupplied, Some(t)) if t != 0 => t,
        _ => compute_total(marks),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSubjectPolicy {
    Reject,
    Zero,
}

impl MissingSubjectPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "zero" => Some(Self::Zero),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Zero => "zero",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GradingError {
    Validation {
        code: &'static str,
        student_id: Option<i64>,
        reason: String,
    },
    Cooldown {
        student_id: i64,
        last_submission: NaiveDate,
        days_elapsed: i64,
        days_remaining: i64,
    },
}

impl GradingError {
    pub fn validation(code: &'static str, student_id: Option<i64>, reason: impl Into<String>) -> Self {
        Self::Validation {
            code,
            student_id,
            reason: reason.into(),
        }
    }

    pub fn unknown_student(student_id: i64) -> Self {
        Self::validation(
            "unknown_student",
            Some(student_id),
            format!("Student with ID {} does not exist", student_id),
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code,
            Self::Cooldown { .. } => "cooldown_violation",
        }
    }

    pub fn student_id(&self) -> Option<i64> {
        match self {
            Self::Validation { student_id, .. } => *student_id,
            Self::Cooldown { student_id, .. } => Some(*student_id),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Validation { reason, .. } => reason.clone(),
            Self::Cooldown {
                student_id,
                last_submission,
                days_elapsed,
                days_remaining,
            } => format!(
                "Cannot submit marks for student {}. Previous submission was {} days ago (last submission: {}). Please wait {} more days.",
                student_id,
                days_elapsed,
                last_submission.format("%Y-%m-%d"),
                days_remaining
            ),
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation { .. } => None,
            Self::Cooldown {
                last_submission,
                days_elapsed,
                days_remaining,
                ..
            } => Some(json!({
                "lastSubmission": last_submission.format("%Y-%m-%d").to_string(),
                "daysElapsed": days_elapsed,
                "daysRemaining": days_remaining,
            })),
        }
    }
}

impl fmt::Display for GradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for GradingError {}

/// Reads `{"Math": .., "Eng": .., "Kis": .., "Sci": .., "SST": ..}`.
/// Absent or null subjects are either rejected or counted as zero per `policy`.
pub fn parse_subject_marks(
    raw: Option<&serde_json::Value>,
    policy: MissingSubjectPolicy,
    student_id: Option<i64>,
) -> Result<SubjectMarks, GradingError> {
    let empty = serde_json::Map::new();
    let obj = match raw {
        None => &empty,
        Some(v) if v.is_null() => &empty,
        Some(v) => v.as_object().ok_or_else(|| {
            GradingError::validation("bad_params", student_id, "subjectMarks must be an object")
        })?,
    };

    let mut values = [0_i64; 5];
    let mut missing: Vec<&str> = Vec::new();
    for (i, key) in SUBJECT_KEYS.iter().copied().enumerate() {
        match obj.get(key) {
            None => missing.push(key),
            Some(v) if v.is_null() => missing.push(key),
            Some(v) => values[i] = parse_mark_value(v, key, student_id)?,
        }
    }

    if !missing.is_empty() && policy == MissingSubjectPolicy::Reject {
        return Err(GradingError::validation(
            "missing_subjects",
            student_id,
            format!("Missing marks for subjects: {}", missing.join(", ")),
        ));
    }
    let marks = SubjectMarks::from_array(values);
    ensure_total_fits(&marks, student_id)?;
    Ok(marks)
}

pub fn parse_mark_value(
    v: &serde_json::Value,
    key: &str,
    student_id: Option<i64>,
) -> Result<i64, GradingError> {
    let n = match v.as_i64() {
        Some(n) => n,
        None => match v.as_f64() {
            Some(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 => f as i64,
            _ => {
                return Err(GradingError::validation(
                    "bad_params",
                    student_id,
                    format!("{} must be a whole number", key),
                ))
            }
        },
    };
    if n < 0 {
        return Err(GradingError::validation(
            "bad_params",
            student_id,
            format!("{} must not be negative", key),
        ));
    }
    Ok(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionDecision {
    Allow,
    Deny { days_elapsed: i64, days_remaining: i64 },
}

pub fn check_submission(previous: Option<NaiveDate>, today: NaiveDate) -> SubmissionDecision {
    let Some(previous) = previous else {
        return SubmissionDecision::Allow;
    };
    let days_elapsed = (today - previous).num_days();
    if days_elapsed < SUBMISSION_COOLDOWN_DAYS {
        SubmissionDecision::Deny {
            days_elapsed,
            days_remaining: SUBMISSION_COOLDOWN_DAYS - days_elapsed,
        }
    } else {
        SubmissionDecision::Allow
    }
}

/// First date a new submission passes the gate, `None` past the calendar's end.
pub fn next_allowed_date(previous: NaiveDate) -> Option<NaiveDate> {
    previous.checked_add_signed(chrono::Duration::days(SUBMISSION_COOLDOWN_DAYS))
}

/// `check_submission` lifted into the error taxonomy.
pub fn gate_submission(
    student_id: i64,
    previous: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<(), GradingError> {
    match (check_submission(previous, today), previous) {
        (
            SubmissionDecision::Deny {
                days_elapsed,
                days_remaining,
            },
            Some(last_submission),
        ) => Err(GradingError::Cooldown {
            student_id,
            last_submission,
            days_elapsed,
            days_remaining,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterStudent {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub class_name: String,
}

impl RosterStudent {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarksRecord {
    pub id: i64,
    pub student_id: i64,
    pub marks: SubjectMarks,
    pub total_marks: i64,
    pub submission_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedMark {
    pub marks: i64,
    pub grade: Band,
}

impl GradedMark {
    fn of(marks: i64) -> Self {
        Self {
            marks,
            grade: band(marks as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResult {
    pub student_id: i64,
    pub student_name: String,
    pub math: GradedMark,
    pub english: GradedMark,
    pub kiswahili: GradedMark,
    pub science: GradedMark,
    pub sst: GradedMark,
    pub average: f64,
    pub avg_grade: Band,
    pub total_marks: i64,
    pub position: usize,
    pub has_marks: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ranking {
    pub classes: BTreeMap<String, Vec<RankedResult>>,
    pub unmatched_student_ids: Vec<i64>,
}

/// Latest record per student by `(submission_date, id)`.
pub fn current_records(records: &[MarksRecord]) -> HashMap<i64, &MarksRecord> {
    let mut out: HashMap<i64, &MarksRecord> = HashMap::new();
    for r in records {
        let newer = out
            .get(&r.student_id)
            .map(|existing| (existing.submission_date, existing.id) < (r.submission_date, r.id))
            .unwrap_or(true);
        if newer {
            out.insert(r.student_id, r);
        }
    }
    out
}

fn grade_student(student: &RosterStudent, record: Option<&MarksRecord>) -> RankedResult {
    let marks = record.map(|r| r.marks).unwrap_or_default();
    let average = compute_average(&marks);
    RankedResult {
        student_id: student.id,
        student_name: student.display_name(),
        math: GradedMark::of(marks.math),
        english: GradedMark::of(marks.eng),
        kiswahili: GradedMark::of(marks.kis),
        science: GradedMark::of(marks.sci),
        sst: GradedMark::of(marks.sst),
        average: round_2_decimals(average),
        avg_grade: band(average),
        total_marks: compute_total(&marks),
        position: 0,
        has_marks: record.is_some(),
        submission_date: record.map(|r| r.submission_date.format("%Y-%m-%d").to_string()),
    }
}

/// Groups the roster by class name and ranks each group by total, highest first.
///
/// Students without a record rank with zero marks. Equal totals keep roster
/// order (the sort is stable) and still receive distinct consecutive positions.
pub fn rank_class(roster: &[RosterStudent], records: &[MarksRecord]) -> Ranking {
    let current = current_records(records);

    let mut classes: BTreeMap<String, Vec<RankedResult>> = BTreeMap::new();
    for student in roster {
        let record = current.get(&student.id).copied();
        classes
            .entry(student.class_name.clone())
            .or_default()
            .push(grade_student(student, record));
    }

    for results in classes.values_mut() {
        results.sort_by(|a, b| b.total_marks.cmp(&a.total_marks));
        for (idx, r) in results.iter_mut().enumerate() {
            r.position = idx + 1;
        }
    }

    let roster_ids: HashSet<i64> = roster.iter().map(|s| s.id).collect();
    let unmatched: BTreeSet<i64> = records
        .iter()
        .map(|r| r.student_id)
        .filter(|id| !roster_ids.contains(id))
        .collect();

    Ranking {
        classes,
        unmatched_student_ids: unmatched.into_iter().collect(),
    }
}

/// Mean of the members' full-precision averages, rounded for display.
///
/// `total_marks` on a ranked result is always the subject sum, so this matches
/// the per-row averages.
pub fn class_average(results: &[RankedResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let sum: f64 = results
        .iter()
        .map(|r| r.total_marks as f64 / SUBJECT_KEYS.len() as f64)
        .sum();
    round_2_decimals(sum / results.len() as f64)
}
