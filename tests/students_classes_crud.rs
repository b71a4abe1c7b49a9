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
fn classes_crud_enforces_unique_names() {
    let workspace = temp_dir("gradebook-classes-crud");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let empty = request_ok(&mut stdin, &mut reader, "0", "classes.list", json!({}));
    assert_eq!(empty["classes"].as_array().map(|a| a.len()), Some(0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "className": "4A", "classTeacher": "Mrs. Njeri" }),
    );
    let class_id = created["classId"].as_str().expect("classId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "className": "4B", "classTeacher": "Mr. Ochieng" }),
    );

    let dup = request(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "className": "4A", "classTeacher": "Someone" }),
    );
    assert_eq!(error_code(&dup), Some("conflict"));
    let missing_teacher = request(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "className": "4C" }),
    );
    assert_eq!(error_code(&missing_teacher), Some("bad_params"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "firstName": "Amina", "lastName": "Otieno", "className": "4A" }),
    );

    let got = request_ok(&mut stdin, &mut reader, "7", "classes.get", json!({ "classId": class_id }));
    assert_eq!(got["class"]["classTeacher"], "Mrs. Njeri");
    assert_eq!(got["class"]["studentCount"], 1);

    let rename_clash = request(
        &mut stdin,
        &mut reader,
        "8",
        "classes.update",
        json!({ "classId": class_id, "patch": { "className": "4B" } }),
    );
    assert_eq!(error_code(&rename_clash), Some("conflict"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.update",
        json!({ "classId": class_id, "patch": { "classTeacher": "Mr. Kiprono" } }),
    );
    let list = request_ok(&mut stdin, &mut reader, "10", "classes.list", json!({}));
    let classes = list["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 2);
    assert_eq!(classes[0]["className"], "4A");
    assert_eq!(classes[0]["classTeacher"], "Mr. Kiprono");

    let _ = request_ok(&mut stdin, &mut reader, "11", "classes.delete", json!({ "classId": class_id }));
    let gone = request(&mut stdin, &mut reader, "12", "classes.get", json!({ "classId": class_id }));
    assert_eq!(error_code(&gone), Some("not_found"));
    let again = request(&mut stdin, &mut reader, "13", "classes.delete", json!({ "classId": class_id }));
    assert_eq!(error_code(&again), Some("not_found"));

    // The student keeps the class label.
    let count = request_ok(&mut stdin, &mut reader, "14", "students.count", json!({}));
    assert_eq!(count["count"], 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_crud_and_delete_removes_history() {
    let workspace = temp_dir("gradebook-students-crud");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "id": 10, "firstName": "Zawadi", "lastName": "Achieng", "className": "5A" }),
    );
    assert_eq!(a["studentId"], 10);
    let b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "firstName": "Baraka", "lastName": "Mwangi", "className": "5A" }),
    );
    let b_id = b["studentId"].as_i64().expect("generated id");
    assert!(b_id > 10);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "firstName": "Imani", "lastName": "Kariuki", "className": "5B" }),
    );

    let dup = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "id": 10, "firstName": "X", "lastName": "Y", "className": "5A" }),
    );
    assert_eq!(error_code(&dup), Some("conflict"));
    let blank = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "firstName": " ", "lastName": "Y", "className": "5A" }),
    );
    assert_eq!(error_code(&blank), Some("bad_params"));

    let class_list = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "className": "5A" }),
    );
    let names: Vec<&str> = class_list["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["firstName"].as_str())
        .collect();
    assert_eq!(names, vec!["Baraka", "Zawadi"]);
    let everyone = request_ok(&mut stdin, &mut reader, "8", "students.list", json!({}));
    assert_eq!(everyone["students"].as_array().map(|a| a.len()), Some(3));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "marks.submit",
        json!({
            "marks": [{ "id": 10, "subjectMarks": { "Math": 50, "Eng": 50, "Kis": 50, "Sci": 50, "SST": 50 } }],
            "submissionDate": "2024-01-10"
        }),
    );
    let by_class = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "marks.listByClass",
        json!({ "className": "5A" }),
    );
    let rows = by_class["students"].as_array().expect("students");
    assert_eq!(rows.len(), 2);
    assert!(rows[0]["latestMarks"].is_null());
    assert_eq!(rows[1]["latestMarks"]["totalMarks"], 250);

    let no_class = request(
        &mut stdin,
        &mut reader,
        "11",
        "marks.listByClass",
        json!({ "className": "9Z" }),
    );
    assert_eq!(error_code(&no_class), Some("not_found"));
    let no_marks = request(
        &mut stdin,
        &mut reader,
        "12",
        "marks.listByStudent",
        json!({ "studentId": b_id }),
    );
    assert_eq!(error_code(&no_marks), Some("not_found"));

    let bad_patch = request(
        &mut stdin,
        &mut reader,
        "13",
        "students.update",
        json!({ "studentId": 10, "patch": { "className": 7 } }),
    );
    assert_eq!(error_code(&bad_patch), Some("bad_params"));

    let deleted = request_ok(&mut stdin, &mut reader, "14", "students.delete", json!({ "studentId": 10 }));
    assert_eq!(deleted["removedMarks"], 1);
    let all = request_ok(&mut stdin, &mut reader, "15", "marks.listAll", json!({}));
    assert_eq!(all["marks"].as_array().map(|a| a.len()), Some(0));
    let missing = request(&mut stdin, &mut reader, "16", "students.delete", json!({ "studentId": 10 }));
    assert_eq!(error_code(&missing), Some("not_found"));

    let count = request_ok(&mut stdin, &mut reader, "17", "students.count", json!({}));
    assert_eq!(count["count"], 2);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
