use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn setup_defaults_and_validation() {
    let workspace = temp_dir("gradebook-setup-defaults");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(setup["grading"]["autoProvisionStudents"], false);
    assert_eq!(setup["grading"]["missingSubjects"], "reject");
    assert_eq!(setup["grading"]["placeholderClassName"], "Unassigned");
    assert_eq!(setup["reports"]["showGeneratedAt"], true);
    assert_eq!(setup["reports"]["includeUnmarkedStudents"], true);
    assert_eq!(setup["reports"]["schoolName"], "");

    for (i, params) in [
        json!({ "section": "grading", "patch": { "missingSubjects": "guess" } }),
        json!({ "section": "grading", "patch": { "autoProvisionStudents": "yes" } }),
        json!({ "section": "grading", "patch": { "placeholderClassName": "  " } }),
        json!({ "section": "grading", "patch": { "bogus": 1 } }),
        json!({ "section": "reports", "patch": { "schoolName": "x".repeat(121) } }),
        json!({ "section": "planner", "patch": {} }),
        json!({ "section": "grading" }),
    ]
    .into_iter()
    .enumerate()
    {
        let resp = request(&mut stdin, &mut reader, &format!("bad-{}", i), "setup.update", params);
        assert_eq!(error_code(&resp), Some("bad_params"), "case {}", i);
    }

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "reports", "patch": { "schoolName": "  Hillside Primary  " } }),
    );
    assert_eq!(updated["value"]["schoolName"], "Hillside Primary");

    let setup = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(setup["reports"]["schoolName"], "Hillside Primary");
    assert_eq!(setup["reports"]["showGeneratedAt"], true);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn missing_subjects_policy_zero_counts_absent_subjects_as_zero() {
    let workspace = temp_dir("gradebook-setup-missing");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "id": 5, "firstName": "Cynthia", "lastName": "Wanjiru", "className": "5B" }),
    );

    let partial = json!({ "marks": [{ "id": 5, "subjectMarks": { "Math": 70, "Eng": 80, "Kis": null } }] });
    let rejected = request_ok(&mut stdin, &mut reader, "3", "marks.submit", partial.clone());
    assert_eq!(rejected["status"], "all_failed");
    assert_eq!(rejected["errors"][0]["code"], "missing_subjects");
    assert_eq!(
        rejected["errors"][0]["message"],
        "Missing marks for subjects: Kis, Sci, SST"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "grading", "patch": { "missingSubjects": "zero" } }),
    );
    let accepted = request_ok(&mut stdin, &mut reader, "5", "marks.submit", partial);
    assert_eq!(accepted["status"], "all_submitted");
    assert_eq!(accepted["submitted"][0]["totalMarks"], 150);

    let negative = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "marks.submit",
        json!({ "marks": [{ "id": 5, "subjectMarks": { "Math": -1 } }], "submissionDate": "2099-01-01" }),
    );
    assert_eq!(negative["errors"][0]["code"], "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn auto_provisioning_creates_placeholder_students_when_enabled() {
    let workspace = temp_dir("gradebook-setup-provision");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "grading", "patch": { "autoProvisionStudents": true } }),
    );

    let marks = json!({ "Math": 40, "Eng": 40, "Kis": 40, "Sci": 40, "SST": 40 });
    let with_class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marks.submit",
        json!({ "marks": [{ "id": 31, "subjectMarks": marks }], "className": "6C" }),
    );
    assert_eq!(with_class["status"], "all_submitted");
    assert_eq!(with_class["submitted"][0]["name"], "Student 31");

    let without_class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "marks.submit",
        json!({ "marks": [{ "id": 32, "subjectMarks": marks }] }),
    );
    assert_eq!(without_class["status"], "all_submitted");

    let s31 = request_ok(&mut stdin, &mut reader, "5", "students.get", json!({ "studentId": 31 }));
    assert_eq!(s31["student"]["className"], "6C");
    assert_eq!(s31["student"]["placeholder"], true);
    let s32 = request_ok(&mut stdin, &mut reader, "6", "students.get", json!({ "studentId": 32 }));
    assert_eq!(s32["student"]["className"], "Unassigned");

    // Items that fail validation never provision a student.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.submit",
        json!({ "marks": [{ "id": 33, "subjectMarks": { "Math": 1 } }] }),
    );
    let s33 = request(&mut stdin, &mut reader, "8", "students.get", json!({ "studentId": 33 }));
    assert_eq!(error_code(&s33), Some("not_found"));

    // Renaming a placeholder makes it a real student.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.update",
        json!({ "studentId": 31, "patch": { "firstName": "Daniel", "lastName": "Mutua" } }),
    );
    let s31 = request_ok(&mut stdin, &mut reader, "10", "students.get", json!({ "studentId": 31 }));
    assert_eq!(s31["student"]["placeholder"], false);
    assert_eq!(s31["student"]["displayName"], "Daniel Mutua");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
