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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn assert_ok(resp: &serde_json::Value) -> serde_json::Value {
    assert_eq!(resp["ok"], json!(true), "expected ok response: {}", resp);
    resp["result"].clone()
}

fn err_code(resp: &serde_json::Value) -> String {
    assert_eq!(resp["ok"], json!(false), "expected error response: {}", resp);
    resp["error"]["code"].as_str().expect("error code").to_string()
}

struct Harness {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    workspace: PathBuf,
    next_id: u32,
}

impl Harness {
    fn new(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, mut stdin, mut reader) = spawn_sidecar();
        let select = request(
            &mut stdin,
            &mut reader,
            "select",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        assert_eq!(select["ok"], json!(true));
        Harness {
            child,
            stdin,
            reader,
            workspace,
            next_id: 0,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn seed_student(&mut self, name: &str, email: &str) -> String {
        let resp = self.call(
            "students.create",
            json!({ "fullName": name, "email": email }),
        );
        assert_ok(&resp)["studentId"]
            .as_str()
            .expect("studentId")
            .to_string()
    }

    /// Five questions with answers A, B, C, D, A.
    fn seed_questions(&mut self) -> Vec<String> {
        let answers = ["A", "B", "C", "D", "A"];
        let mut ids = Vec::new();
        for (i, ans) in answers.iter().enumerate() {
            let resp = self.call(
                "questions.create",
                json!({
                    "question": format!("Question {}", i + 1),
                    "options": ["A", "B", "C", "D"],
                    "answer": ans
                }),
            );
            ids.push(
                assert_ok(&resp)["questionId"]
                    .as_str()
                    .expect("questionId")
                    .to_string(),
            );
        }
        ids
    }

    fn marker_exists(&self, student_id: &str) -> bool {
        self.workspace
            .join(format!("apti-completed-{}", student_id))
            .is_file()
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.workspace);
    }
}

#[test]
fn timer_expiry_submits_partial_answers_full_length() {
    let mut h = Harness::new("aptituded-session-timer");
    let student = h.seed_student("Dana Iyer", "dana@example.com");
    let _questions = h.seed_questions();

    let started = assert_ok(&h.call(
        "session.start",
        json!({ "studentId": student, "durationSecs": 5 }),
    ));
    assert_eq!(started["session"]["status"], json!("active"));
    assert_eq!(started["questions"].as_array().expect("questions").len(), 5);
    // Answers are never exposed to the session question feed.
    assert!(started["questions"][0].get("answer").is_none());

    assert_ok(&h.call("session.answer", json!({ "index": 0, "value": "A" })));
    assert_ok(&h.call("session.answer", json!({ "index": 1, "value": "C" })));

    let ticked = assert_ok(&h.call("session.tick", json!({ "seconds": 4 })));
    assert_eq!(ticked["session"]["remainingSecs"], json!(1));

    // The last tick fires the timer trigger and drives the finish procedure.
    let finished = assert_ok(&h.call("session.tick", json!({})));
    assert_eq!(finished["message"], json!("Result saved"));
    assert_eq!(finished["session"]["status"], json!("completed"));
    assert_eq!(finished["session"]["finishTrigger"], json!("timerExpired"));
    let answers = finished["result"]["answers"].as_array().expect("answers");
    assert_eq!(answers.len(), 5);
    assert_eq!(answers[0], json!("A"));
    assert_eq!(answers[2], json!(""));
    assert_eq!(finished["result"]["score"], json!(1));
    assert_eq!(finished["result"]["notAnswered"], json!(3));

    assert!(h.marker_exists(&student));
    let check = assert_ok(&h.call("results.check", json!({ "studentId": student })));
    assert_eq!(check["allowed"], json!(false));

    // Ticking after completion stays inert.
    let idle = assert_ok(&h.call("session.tick", json!({})));
    assert_eq!(idle["session"]["status"], json!("completed"));

    h.finish();
}

#[test]
fn violation_limit_auto_submits_exactly_once() {
    let mut h = Harness::new("aptituded-session-violations");
    let student = h.seed_student("Eli Fox", "eli@example.com");
    let _questions = h.seed_questions();

    assert_ok(&h.call("session.start", json!({ "studentId": student })));
    assert_ok(&h.call("session.answer", json!({ "index": 0, "value": "A" })));

    let w1 = assert_ok(&h.call("session.violation", json!({ "atMs": 1000 })));
    assert_eq!(w1["counted"], json!(true));
    assert_eq!(w1["violations"], json!(1));

    // A blur arriving right behind the visibility loss is the same event pair.
    let paired = assert_ok(&h.call("session.violation", json!({ "atMs": 1080 })));
    assert_eq!(paired["counted"], json!(false));
    assert_eq!(paired["debounced"], json!(true));
    assert_eq!(paired["violations"], json!(1));

    let w2 = assert_ok(&h.call("session.violation", json!({ "atMs": 3000 })));
    assert_eq!(w2["violations"], json!(2));
    let w3 = assert_ok(&h.call("session.violation", json!({ "atMs": 5000 })));
    assert_eq!(w3["violations"], json!(3));
    assert_eq!(w3["limitReached"], json!(false));

    // Fourth counted violation crosses the threshold and auto-submits.
    let finished = assert_ok(&h.call("session.violation", json!({ "atMs": 7000 })));
    assert_eq!(finished["message"], json!("Result saved"));
    assert_eq!(finished["session"]["status"], json!("completed"));
    assert_eq!(
        finished["session"]["finishTrigger"],
        json!("violationLimit")
    );

    // Late signals after completion are dropped, and no second Result exists.
    let late = assert_ok(&h.call("session.violation", json!({ "atMs": 9000 })));
    assert_eq!(late["counted"], json!(false));
    let listed = assert_ok(&h.call("results.list", json!({})));
    assert_eq!(listed["results"].as_array().expect("results").len(), 1);

    h.finish();
}

#[test]
fn start_is_gated_by_eligibility_and_retest_reopens_it() {
    let mut h = Harness::new("aptituded-session-eligibility");
    let student = h.seed_student("Gin Park", "gin@example.com");
    let questions = h.seed_questions();

    assert_ok(&h.call(
        "results.save",
        json!({
            "studentId": student,
            "questionIds": questions,
            "answers": ["A", "B", "C", "D", "A"]
        }),
    ));

    let refused = h.call("session.start", json!({ "studentId": student }));
    assert_eq!(err_code(&refused), "forbidden");

    let ghost = h.call("session.start", json!({ "studentId": "ghost" }));
    assert_eq!(err_code(&ghost), "not_found");

    assert_ok(&h.call("results.retest", json!({ "studentId": student })));
    let started = assert_ok(&h.call("session.start", json!({ "studentId": student })));
    assert_eq!(started["session"]["status"], json!("active"));

    h.finish();
}

#[test]
fn failed_save_is_surfaced_and_session_recovers() {
    let mut h = Harness::new("aptituded-session-failure");
    let student = h.seed_student("Hana Sato", "hana@example.com");
    let questions = h.seed_questions();

    assert_ok(&h.call("session.start", json!({ "studentId": student })));
    assert_ok(&h.call("session.answer", json!({ "index": 0, "value": "A" })));

    // The student submits out of band; the session's save must now fail
    // loudly instead of silently dropping the attempt.
    assert_ok(&h.call(
        "results.save",
        json!({
            "studentId": student,
            "questionIds": questions,
            "answers": ["", "", "", "", ""]
        }),
    ));

    let failed = h.call("session.submit", json!({}));
    assert_eq!(err_code(&failed), "forbidden");
    assert!(failed["error"]["message"]
        .as_str()
        .expect("message")
        .starts_with("test not saved"));

    let status = assert_ok(&h.call("session.status", json!({})));
    assert_eq!(status["session"]["status"], json!("failed"));
    assert!(status["session"]["lastError"].as_str().is_some());
    assert!(!h.marker_exists(&student));

    // Starting over requires discarding the failed session first.
    let blocked = h.call("session.start", json!({ "studentId": student }));
    assert_eq!(err_code(&blocked), "bad_state");
    assert_ok(&h.call("session.reset", json!({})));

    // After an admin retest the student can run a fresh session to completion.
    assert_ok(&h.call("results.retest", json!({ "studentId": student })));
    assert_ok(&h.call("session.start", json!({ "studentId": student })));
    let finished = assert_ok(&h.call("session.submit", json!({})));
    assert_eq!(finished["session"]["status"], json!("completed"));
    assert_eq!(finished["result"]["attempt"], json!(2));

    h.finish();
}

#[test]
fn navigation_and_state_guards() {
    let mut h = Harness::new("aptituded-session-nav");
    let student = h.seed_student("Ivo Lund", "ivo@example.com");
    let _questions = h.seed_questions();

    let resp = h.call("session.answer", json!({ "index": 0, "value": "A" }));
    assert_eq!(err_code(&resp), "bad_state");

    assert_ok(&h.call("session.start", json!({ "studentId": student })));

    let resp = h.call("session.start", json!({ "studentId": student }));
    assert_eq!(err_code(&resp), "bad_state");

    // Clamped at the last question.
    for _ in 0..6 {
        let moved = assert_ok(&h.call("session.next", json!({})));
        assert!(moved["currentQuestion"].as_u64().expect("index") <= 4);
    }
    let moved = assert_ok(&h.call("session.skip", json!({})));
    assert_eq!(moved["currentQuestion"], json!(4));
    // And at the first.
    for _ in 0..6 {
        let _ = assert_ok(&h.call("session.previous", json!({})));
    }
    let status = assert_ok(&h.call("session.status", json!({})));
    assert_eq!(status["session"]["currentQuestion"], json!(0));

    let resp = h.call("session.answer", json!({ "index": 99, "value": "A" }));
    assert_eq!(err_code(&resp), "bad_params");

    // An in-flight session cannot be reset away.
    let resp = h.call("session.reset", json!({}));
    assert_eq!(err_code(&resp), "bad_state");

    h.finish();
}
