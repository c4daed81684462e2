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
    let exe = env!("CARGO_BIN_EXE_rosterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rosterd");
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
    serde_json::from_str(line.trim()).expect("parse response json")
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
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn next_no(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) -> String {
    request_ok(stdin, reader, id, "students.nextNo", json!({}))
        .get("studentNo")
        .and_then(|v| v.as_str())
        .expect("studentNo")
        .to_string()
}

#[test]
fn empty_store_allocates_the_floor() {
    let workspace = temp_dir("rosterd-alloc-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(next_no(&mut stdin, &mut reader, "2"), "1070010");
}

#[test]
fn allocator_ignores_non_numeric_and_sub_floor_numbers() {
    let workspace = temp_dir("rosterd-alloc-mixed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Same population as the documented example: two valid numbers, one
    // non-numeric legacy value, one below the floor.
    for (i, no) in ["1070010", "1070011", "abc", "1070005"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("seed{}", i),
            "students.create",
            json!({ "lastName": "Seed", "firstName": format!("S{}", i), "studentNo": no }),
        );
    }

    assert_eq!(next_no(&mut stdin, &mut reader, "peek"), "1070012");
}

#[test]
fn consecutive_auto_creates_are_sequential() {
    let workspace = temp_dir("rosterd-alloc-seq");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut nos = Vec::new();
    for i in 0..5 {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "students.create",
            json!({ "lastName": "Aliyev", "firstName": format!("N{}", i) }),
        );
        nos.push(
            created
                .get("studentNo")
                .and_then(|v| v.as_str())
                .expect("studentNo")
                .to_string(),
        );
    }
    assert_eq!(
        nos,
        vec!["1070010", "1070011", "1070012", "1070013", "1070014"]
    );
}

#[test]
fn peeking_does_not_reserve() {
    let workspace = temp_dir("rosterd-alloc-peek");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    assert_eq!(next_no(&mut stdin, &mut reader, "p1"), "1070010");
    assert_eq!(next_no(&mut stdin, &mut reader, "p2"), "1070010");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "c",
        "students.create",
        json!({ "lastName": "Rustamov", "firstName": "Bek" }),
    );
    assert_eq!(
        created.get("studentNo").and_then(|v| v.as_str()),
        Some("1070010")
    );
    assert_eq!(next_no(&mut stdin, &mut reader, "p3"), "1070011");
}

#[test]
fn duplicate_explicit_number_is_rejected_at_insert() {
    let workspace = temp_dir("rosterd-alloc-dup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
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
        json!({ "lastName": "First", "firstName": "In", "studentNo": "1070010" }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "lastName": "Second", "firstName": "In", "studentNo": "1070010" }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("duplicate_student_no")
    );

    // The losing insert must not have left a row behind.
    let listed = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    assert_eq!(
        listed
            .get("students")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
}
