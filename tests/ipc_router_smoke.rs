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
    let exe = env!("CARGO_BIN_EXE_aptituded");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn aptituded");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("aptituded-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));

    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "fullName": "Smoke Student",
            "email": "smoke@example.com",
            "department": "CSE"
        }),
    );
    let student_id = created["result"]["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "4", "students.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "studentId": student_id }),
    );

    let q = request(
        &mut stdin,
        &mut reader,
        "6",
        "questions.create",
        json!({
            "question": "2 + 2 = ?",
            "options": ["3", "4"],
            "answer": "4",
            "category": "math",
            "difficulty": "easy"
        }),
    );
    let question_id = q["result"]["questionId"]
        .as_str()
        .expect("questionId")
        .to_string();

    let listed = request(&mut stdin, &mut reader, "7", "questions.list", json!({}));
    assert_eq!(
        listed["result"]["questions"]
            .as_array()
            .expect("questions")
            .len(),
        1
    );

    let check = request(
        &mut stdin,
        &mut reader,
        "8",
        "results.check",
        json!({ "studentId": student_id }),
    );
    assert_eq!(check["result"]["allowed"], json!(true));

    let _ = request(&mut stdin, &mut reader, "9", "results.list", json!({}));

    let status = request(&mut stdin, &mut reader, "10", "session.status", json!({}));
    assert_eq!(status["result"]["session"], json!(null));
    let _ = request(&mut stdin, &mut reader, "11", "session.reset", json!({}));

    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "questions.delete",
        json!({ "questionId": question_id }),
    );

    // Unknown methods still get a response line.
    let payload = json!({ "id": "13", "method": "nonsense.method", "params": {} });
    writeln!(stdin, "{}", payload).expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let resp: serde_json::Value = serde_json::from_str(line.trim()).expect("parse");
    assert_eq!(resp["error"]["code"], json!("not_implemented"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
