use crate::calc::MissingSubjectPolicy;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::report::ReportOptions;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Reports,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "autoProvisionStudents": false,
            "missingSubjects": "reject",
            "placeholderClassName": "Unassigned"
        }),
        SetupSection::Reports => json!({
            "schoolName": "",
            "showGeneratedAt": true,
            "includeUnmarkedStudents": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "autoProvisionStudents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "missingSubjects" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(policy) = MissingSubjectPolicy::parse(&s) else {
                        return Err("missingSubjects must be one of: reject, zero".into());
                    };
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                "placeholderClassName" => {
                    let s = parse_string_max(v, k, 100)?;
                    if s.is_empty() {
                        return Err(format!("{} must not be empty", k));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "schoolName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "showGeneratedAt" | "includeUnmarkedStudents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values fall back to defaults.
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone)]
pub struct GradingSettings {
    pub auto_provision_students: bool,
    pub missing_subjects: MissingSubjectPolicy,
    pub placeholder_class_name: String,
}

pub fn load_grading_settings(conn: &rusqlite::Connection) -> anyhow::Result<GradingSettings> {
    let v = load_section(conn, SetupSection::Grading)?;
    Ok(GradingSettings {
        auto_provision_students: v
            .get("autoProvisionStudents")
            .and_then(|x| x.as_bool())
            .unwrap_or(false),
        missing_subjects: v
            .get("missingSubjects")
            .and_then(|x| x.as_str())
            .and_then(MissingSubjectPolicy::parse)
            .unwrap_or(MissingSubjectPolicy::Reject),
        placeholder_class_name: v
            .get("placeholderClassName")
            .and_then(|x| x.as_str())
            .unwrap_or("Unassigned")
            .to_string(),
    })
}

pub fn load_report_options(conn: &rusqlite::Connection) -> anyhow::Result<ReportOptions> {
    let v = load_section(conn, SetupSection::Reports)?;
    let defaults = ReportOptions::default();
    Ok(ReportOptions {
        include_unmarked_students: v
            .get("includeUnmarkedStudents")
            .and_then(|x| x.as_bool())
            .unwrap_or(defaults.include_unmarked_students),
        school_name: v
            .get("schoolName")
            .and_then(|x| x.as_str())
            .map(|s| s.to_string())
            .unwrap_or(defaults.school_name),
        show_generated_at: v
            .get("showGeneratedAt")
            .and_then(|x| x.as_bool())
            .unwrap_or(defaults.show_generated_at),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "reports": reports
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.key(), "settings updated");
    ok(
        &req.id,
        json!({ "ok": true, "section": section_raw, "value": current }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
