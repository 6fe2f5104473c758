use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_questions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let question = match req.params.get("question").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing question", None),
    };
    let options: Vec<String> = match req.params.get("options").and_then(|v| v.as_array()) {
        Some(arr) if !arr.is_empty() => {
            let mut out = Vec::with_capacity(arr.len());
            for v in arr {
                match v.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => {
                        return err(
                            &req.id,
                            "bad_params",
                            "options must be an array of strings",
                            None,
                        )
                    }
                }
            }
            out
        }
        _ => return err(&req.id, "bad_params", "missing options", None),
    };
    let answer = match req.params.get("answer").and_then(|v| v.as_str()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing answer", None),
    };
    if !options.iter().any(|o| o == &answer) {
        return err(&req.id, "bad_params", "answer must be one of options", None);
    }
    let category = req
        .params
        .get("category")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let difficulty = req
        .params
        .get("difficulty")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM questions",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let question_id = Uuid::new_v4().to_string();
    let options_json = match serde_json::to_string(&options) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    if let Err(e) = conn.execute(
        "INSERT INTO questions(id, question, options, answer, category, difficulty, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![question_id, question, options_json, answer, category, difficulty, sort_order],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }

    ok(&req.id, json!({ "questionId": question_id }))
}

fn handle_questions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "questions": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, question, options, answer, category, difficulty
         FROM questions ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let question: String = r.get(1)?;
            let options_json: String = r.get(2)?;
            let answer: String = r.get(3)?;
            let category: String = r.get(4)?;
            let difficulty: String = r.get(5)?;
            let options: Vec<String> =
                serde_json::from_str(&options_json).unwrap_or_default();
            Ok(json!({
                "id": id,
                "question": question,
                "options": options,
                "answer": answer,
                "category": category,
                "difficulty": difficulty
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(questions) => ok(&req.id, json!({ "questions": questions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_questions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let question_id = match req.params.get("questionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing questionId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM questions WHERE id = ?", [&question_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "question not found", None);
    }

    if let Err(e) = conn.execute("DELETE FROM questions WHERE id = ?", [&question_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "questions.create" => Some(handle_questions_create(state, req)),
        "questions.list" => Some(handle_questions_list(state, req)),
        "questions.delete" => Some(handle_questions_delete(state, req)),
        _ => None,
    }
}
