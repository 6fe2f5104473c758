use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, SubmitError};
use crate::session::{
    CompletionStore, FileCompletionStore, FinishTrigger, QuizSession, SessionQuestion,
    SessionStatus, ViolationOutcome, DEFAULT_DURATION_SECS, VIOLATION_WARN_LIMIT,
};
use rusqlite::OptionalExtension;
use serde_json::json;

fn snapshot_json(sess: &QuizSession) -> serde_json::Value {
    serde_json::to_value(sess.snapshot()).unwrap_or_else(|_| json!({}))
}

fn handle_session_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let duration_secs = match req.params.get("durationSecs") {
        None => DEFAULT_DURATION_SECS,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => n,
            _ => return err(&req.id, "bad_params", "durationSecs must be positive", None),
        },
    };

    if let Some(sess) = state.session.as_ref() {
        match sess.status() {
            SessionStatus::Completed => {
                // Replaced below, gated by the eligibility check.
            }
            SessionStatus::Failed => {
                return err(
                    &req.id,
                    "bad_state",
                    "a failed session is pending; session.submit retries it, session.reset discards it",
                    None,
                );
            }
            _ => {
                return err(&req.id, "bad_state", "a session is already active", None);
            }
        }
    }

    // Eligibility is the authoritative gate; the completion marker only
    // sharpens the refusal message.
    let test_given: Option<i64> = match conn
        .query_row(
            "SELECT test_given FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(test_given) = test_given else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let mut store = FileCompletionStore::new(&workspace);
    if test_given != 0 {
        let message = if store.is_completed(&student_id) {
            "test already completed on this device; wait for admin to allow a retest"
        } else {
            "test already submitted; wait for admin to allow a retest"
        };
        return err(&req.id, "forbidden", message, None);
    }
    if let Err(e) = store.clear(&student_id) {
        log::warn!("failed to clear completion marker for {}: {}", student_id, e);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, question, options FROM questions ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let questions = match stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let question: String = r.get(1)?;
            let options_json: String = r.get(2)?;
            let options: Vec<String> =
                serde_json::from_str(&options_json).unwrap_or_default();
            Ok(SessionQuestion {
                id,
                question,
                options,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut sess = QuizSession::new(&student_id);
    if let Err(e) = sess.begin_loading() {
        return err(&req.id, e.code(), e.message(), None);
    }
    if let Err(e) = sess.activate(questions, duration_secs) {
        return err(&req.id, e.code(), e.message(), None);
    }

    log::info!(
        "session started for student {} ({} questions, {}s budget)",
        student_id,
        sess.questions().len(),
        duration_secs
    );

    let questions_json =
        serde_json::to_value(sess.questions()).unwrap_or_else(|_| json!([]));
    let snapshot = snapshot_json(&sess);
    state.session = Some(sess);

    ok(
        &req.id,
        json!({ "session": snapshot, "questions": questions_json }),
    )
}

/// Shared finish procedure for all three termination triggers and the manual
/// retry path. A save failure is surfaced to the caller and leaves the session
/// in `failed` with its answers intact.
fn finish_session(state: &mut AppState, req: &Request, trigger: FinishTrigger) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(sess) = state.session.as_mut() else {
        return err(&req.id, "bad_state", "no active session", None);
    };

    let payload = match sess.begin_saving(trigger) {
        Ok(p) => p,
        Err(e) => return err(&req.id, e.code(), e.message(), None),
    };

    match scoring::submit_attempt(conn, sess.student_id(), &payload.question_ids, &payload.answers)
    {
        Ok(saved) => {
            let _ = sess.complete();
            let mut store = FileCompletionStore::new(&workspace);
            if let Err(e) = store.set_completed(sess.student_id()) {
                log::warn!(
                    "failed to persist completion marker for {}: {}",
                    sess.student_id(),
                    e
                );
            }
            log::info!(
                "session finished for student {} ({:?})",
                sess.student_id(),
                trigger
            );
            ok(
                &req.id,
                json!({
                    "message": "Result saved",
                    "result": saved,
                    "session": snapshot_json(sess),
                    "redirect": "dashboard"
                }),
            )
        }
        Err(e) => {
            let code = e.code();
            let message = e.message();
            let details = match &e {
                SubmitError::AttemptBlocked { retest_count } => {
                    json!({ "retestCount": retest_count })
                }
                _ => json!({}),
            };
            let _ = sess.fail(message.clone());
            log::warn!(
                "submission failed for student {}: {}",
                sess.student_id(),
                message
            );
            err(
                &req.id,
                code,
                format!("test not saved: {}", message),
                Some(json!({ "session": snapshot_json(sess), "submit": details })),
            )
        }
    }
}

fn handle_session_answer(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(sess) = state.session.as_mut() else {
        return err(&req.id, "bad_state", "no active session", None);
    };
    let index = match req.params.get("index").and_then(|v| v.as_u64()) {
        Some(v) => v as usize,
        None => return err(&req.id, "bad_params", "missing index", None),
    };
    let value = match req.params.get("value").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing value", None),
    };

    match sess.set_answer(index, &value) {
        Ok(()) => ok(&req.id, json!({ "index": index, "value": value })),
        Err(e) => err(&req.id, e.code(), e.message(), None),
    }
}

fn handle_session_nav(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(sess) = state.session.as_mut() else {
        return err(&req.id, "bad_state", "no active session", None);
    };
    let moved = match req.method.as_str() {
        "session.previous" => sess.previous(),
        // skip is next without requiring an answer
        _ => sess.next(),
    };
    match moved {
        Ok(current) => ok(&req.id, json!({ "currentQuestion": current })),
        Err(e) => err(&req.id, e.code(), e.message(), None),
    }
}

fn handle_session_tick(state: &mut AppState, req: &Request) -> serde_json::Value {
    let secs = match req.params.get("seconds") {
        None => 1,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => n,
            _ => return err(&req.id, "bad_params", "seconds must be positive", None),
        },
    };

    let trigger = {
        let Some(sess) = state.session.as_mut() else {
            return err(&req.id, "bad_state", "no active session", None);
        };
        if sess.status() != SessionStatus::Active {
            // Inert once the session left Active; report state as-is.
            return ok(&req.id, json!({ "session": snapshot_json(sess) }));
        }
        sess.tick(secs)
    };

    match trigger {
        Some(t) => finish_session(state, req, t),
        None => match state.session.as_ref() {
            Some(sess) => ok(&req.id, json!({ "session": snapshot_json(sess) })),
            None => err(&req.id, "bad_state", "no active session", None),
        },
    }
}

fn handle_session_violation(state: &mut AppState, req: &Request) -> serde_json::Value {
    let at_ms = match req.params.get("atMs") {
        None => chrono::Utc::now().timestamp_millis(),
        Some(v) => match v.as_i64() {
            Some(n) => n,
            None => return err(&req.id, "bad_params", "atMs must be an integer", None),
        },
    };

    let (outcome, violations) = {
        let Some(sess) = state.session.as_mut() else {
            return err(&req.id, "bad_state", "no active session", None);
        };
        let outcome = sess.report_violation(at_ms);
        (outcome, sess.violations())
    };

    match outcome {
        ViolationOutcome::Ignored => ok(
            &req.id,
            json!({ "counted": false, "violations": violations }),
        ),
        ViolationOutcome::Debounced => ok(
            &req.id,
            json!({ "counted": false, "debounced": true, "violations": violations }),
        ),
        ViolationOutcome::Warning(n) => {
            log::warn!("integrity violation {} of {}", n, VIOLATION_WARN_LIMIT);
            ok(
                &req.id,
                json!({
                    "counted": true,
                    "violations": n,
                    "limitReached": false,
                    "warning": format!(
                        "warning {} of {}: do not leave the test page",
                        n, VIOLATION_WARN_LIMIT
                    )
                }),
            )
        }
        ViolationOutcome::LimitReached => {
            log::warn!("integrity violation limit exceeded; auto-submitting");
            finish_session(state, req, FinishTrigger::ViolationLimit)
        }
    }
}

fn handle_session_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.session.is_none() {
        return err(&req.id, "bad_state", "no active session", None);
    }
    finish_session(state, req, FinishTrigger::Submitted)
}

fn handle_session_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = state.session.as_ref().map(snapshot_json);
    ok(&req.id, json!({ "session": session }))
}

fn handle_session_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.as_ref().map(|s| s.status()) {
        None => ok(&req.id, json!({ "cleared": false })),
        Some(SessionStatus::Completed) | Some(SessionStatus::Failed) => {
            state.session = None;
            ok(&req.id, json!({ "cleared": true }))
        }
        Some(_) => err(
            &req.id,
            "bad_state",
            "session still in progress; submit it first",
            None,
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.start" => Some(handle_session_start(state, req)),
        "session.answer" => Some(handle_session_answer(state, req)),
        "session.next" | "session.previous" | "session.skip" => {
            Some(handle_session_nav(state, req))
        }
        "session.tick" => Some(handle_session_tick(state, req)),
        "session.violation" => Some(handle_session_violation(state, req)),
        "session.submit" => Some(handle_session_submit(state, req)),
        "session.status" => Some(handle_session_status(state, req)),
        "session.reset" => Some(handle_session_reset(state, req)),
        _ => None,
    }
}
