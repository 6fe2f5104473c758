use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, SubmitError};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;

fn string_array(params: &serde_json::Value, key: &str) -> Option<Vec<String>> {
    let arr = params.get(key)?.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        out.push(v.as_str()?.to_string());
    }
    Some(out)
}

fn submit_error(req: &Request, e: SubmitError) -> serde_json::Value {
    let details = match &e {
        SubmitError::AttemptBlocked { retest_count } => {
            Some(json!({ "retestCount": retest_count }))
        }
        _ => None,
    };
    err(&req.id, e.code(), e.message(), details)
}

fn handle_results_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(question_ids) = string_array(&req.params, "questionIds") else {
        return err(
            &req.id,
            "bad_params",
            "questionIds must be an array of strings",
            None,
        );
    };
    let Some(answers) = string_array(&req.params, "answers") else {
        return err(
            &req.id,
            "bad_params",
            "answers must be an array of strings",
            None,
        );
    };

    match scoring::submit_attempt(conn, &student_id, &question_ids, &answers) {
        Ok(saved) => ok(
            &req.id,
            json!({ "message": "Result saved", "result": saved }),
        ),
        Err(e) => submit_error(req, e),
    }
}

fn handle_results_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

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

    match test_given {
        Some(tg) => ok(&req.id, json!({ "allowed": tg == 0 })),
        None => err(&req.id, "not_found", "student not found", None),
    }
}

fn handle_results_retest(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let retest_count: Option<i64> = match conn
        .query_row(
            "SELECT retest_count FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(retest_count) = retest_count else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if retest_count >= 2 {
        return err(
            &req.id,
            "forbidden",
            "student has reached maximum test attempts",
            Some(json!({ "retestCount": retest_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM results WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "results" })),
        );
    }
    if let Err(e) = tx.execute(
        "UPDATE students SET test_given = 0, retest_count = retest_count + 1, updated_at = ?
         WHERE id = ?",
        rusqlite::params![Utc::now().to_rfc3339(), student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    log::info!(
        "retest granted for student {} (retest {} of 2)",
        student_id,
        retest_count + 1
    );

    ok(
        &req.id,
        json!({
            "message": "student can now give test again",
            "retestCount": retest_count + 1
        }),
    )
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           r.id, r.student_id, r.question_ids, r.answers,
           r.score, r.correct_answers, r.wrong_answers, r.not_answered,
           r.attempt, r.created_at,
           s.full_name, s.email, s.mobile, s.department, s.college, s.retest_count
         FROM results r
         JOIN students s ON s.id = r.student_id
         ORDER BY r.created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let question_ids_json: String = r.get(2)?;
            let answers_json: String = r.get(3)?;
            let score: i64 = r.get(4)?;
            let correct_answers: i64 = r.get(5)?;
            let wrong_answers: i64 = r.get(6)?;
            let not_answered: i64 = r.get(7)?;
            let attempt: i64 = r.get(8)?;
            let created_at: String = r.get(9)?;
            let full_name: String = r.get(10)?;
            let email: String = r.get(11)?;
            let mobile: String = r.get(12)?;
            let department: String = r.get(13)?;
            let college: String = r.get(14)?;
            let retest_count: i64 = r.get(15)?;

            let question_ids: Vec<String> =
                serde_json::from_str(&question_ids_json).unwrap_or_default();
            let answers: Vec<String> = serde_json::from_str(&answers_json).unwrap_or_default();

            Ok(json!({
                "id": id,
                "studentId": student_id,
                "questionIds": question_ids,
                "answers": answers,
                "score": score,
                "correctAnswers": correct_answers,
                "wrongAnswers": wrong_answers,
                "notAnswered": not_answered,
                "attempt": attempt,
                "createdAt": created_at,
                "student": {
                    "fullName": full_name,
                    "email": email,
                    "mobile": mobile,
                    "department": department,
                    "college": college,
                    "retestCount": retest_count
                }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.save" => Some(handle_results_save(state, req)),
        "results.check" => Some(handle_results_check(state, req)),
        "results.retest" => Some(handle_results_retest(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        _ => None,
    }
}
