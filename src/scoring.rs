use chrono::Utc;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Position-wise classification of one submitted answer against the
/// authoritative answer (exact, case-sensitive string equality).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Correct,
    Wrong,
    NotAnswered,
}

pub fn classify(submitted: &str, authoritative: Option<&str>) -> AnswerOutcome {
    if submitted.is_empty() {
        return AnswerOutcome::NotAnswered;
    }
    match authoritative {
        Some(a) if a == submitted => AnswerOutcome::Correct,
        _ => AnswerOutcome::Wrong,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub score: i64,
    pub correct_answers: i64,
    pub wrong_answers: i64,
    pub not_answered: i64,
}

/// Counts correct/wrong/unanswered over the parallel arrays. An id missing
/// from the answer key never matches, so a non-empty answer for it is wrong.
pub fn tally(
    question_ids: &[String],
    answers: &[String],
    answer_key: &HashMap<String, String>,
) -> Tally {
    let mut correct: i64 = 0;
    let mut wrong: i64 = 0;
    let mut not_answered: i64 = 0;

    for (qid, ans) in question_ids.iter().zip(answers.iter()) {
        match classify(ans, answer_key.get(qid).map(|s| s.as_str())) {
            AnswerOutcome::Correct => correct += 1,
            AnswerOutcome::Wrong => wrong += 1,
            AnswerOutcome::NotAnswered => not_answered += 1,
        }
    }

    Tally {
        score: correct,
        correct_answers: correct,
        wrong_answers: wrong,
        not_answered,
    }
}

#[derive(Debug)]
pub enum SubmitError {
    Invalid(String),
    StudentNotFound,
    AttemptBlocked { retest_count: i64 },
    Storage(anyhow::Error),
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::Invalid(_) => "bad_params",
            SubmitError::StudentNotFound => "not_found",
            SubmitError::AttemptBlocked { .. } => "forbidden",
            SubmitError::Storage(_) => "db_tx_failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            SubmitError::Invalid(m) => m.clone(),
            SubmitError::StudentNotFound => "student not found".to_string(),
            SubmitError::AttemptBlocked { retest_count } if *retest_count >= 2 => {
                "maximum test attempts reached, contact admin".to_string()
            }
            SubmitError::AttemptBlocked { .. } => {
                "test already submitted, wait for admin to allow a retest".to_string()
            }
            SubmitError::Storage(e) => e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedResult {
    pub id: String,
    pub student_id: String,
    pub question_ids: Vec<String>,
    pub answers: Vec<String>,
    pub score: i64,
    pub correct_answers: i64,
    pub wrong_answers: i64,
    pub not_answered: i64,
    pub attempt: i64,
    pub created_at: String,
}

fn load_answer_key(
    conn: &Connection,
    question_ids: &[String],
) -> anyhow::Result<HashMap<String, String>> {
    if question_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; question_ids.len()].join(",");
    let sql = format!(
        "SELECT id, answer FROM questions WHERE id IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(question_ids.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

/// Scores and persists one attempt. The Result insert and the student's
/// `test_given` flip happen in one transaction; the flip is conditional on
/// `test_given = 0`, so a second submission for the same student (including a
/// racing one) aborts without leaving a Result behind.
pub fn submit_attempt(
    conn: &Connection,
    student_id: &str,
    question_ids: &[String],
    answers: &[String],
) -> Result<SavedResult, SubmitError> {
    if student_id.trim().is_empty() {
        return Err(SubmitError::Invalid("missing studentId".to_string()));
    }
    if question_ids.len() != answers.len() {
        return Err(SubmitError::Invalid(format!(
            "questionIds and answers must have equal length ({} vs {})",
            question_ids.len(),
            answers.len()
        )));
    }

    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT test_given, retest_count FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| SubmitError::Storage(e.into()))?;
    let Some((test_given, retest_count)) = row else {
        return Err(SubmitError::StudentNotFound);
    };
    if test_given != 0 {
        return Err(SubmitError::AttemptBlocked { retest_count });
    }

    let answer_key = load_answer_key(conn, question_ids).map_err(SubmitError::Storage)?;
    let counts = tally(question_ids, answers, &answer_key);

    let result_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let attempt = retest_count + 1;
    let question_ids_json =
        serde_json::to_string(question_ids).map_err(|e| SubmitError::Storage(e.into()))?;
    let answers_json =
        serde_json::to_string(answers).map_err(|e| SubmitError::Storage(e.into()))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| SubmitError::Storage(e.into()))?;

    if let Err(e) = tx.execute(
        "INSERT INTO results(
            id, student_id, question_ids, answers,
            score, correct_answers, wrong_answers, not_answered,
            attempt, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            result_id,
            student_id,
            question_ids_json,
            answers_json,
            counts.score,
            counts.correct_answers,
            counts.wrong_answers,
            counts.not_answered,
            attempt,
            now
        ],
    ) {
        let _ = tx.rollback();
        return Err(SubmitError::Storage(e.into()));
    }

    let updated = match tx.execute(
        "UPDATE students SET test_given = 1, updated_at = ? WHERE id = ? AND test_given = 0",
        rusqlite::params![now, student_id],
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return Err(SubmitError::Storage(e.into()));
        }
    };
    if updated == 0 {
        // Someone flipped the flag between the pre-check and here.
        let _ = tx.rollback();
        return Err(SubmitError::AttemptBlocked { retest_count });
    }

    tx.commit().map_err(|e| SubmitError::Storage(e.into()))?;

    log::info!(
        "scored attempt {} for student {}: {}/{} correct",
        attempt,
        student_id,
        counts.correct_answers,
        question_ids.len()
    );

    Ok(SavedResult {
        id: result_id,
        student_id: student_id.to_string(),
        question_ids: question_ids.to_vec(),
        answers: answers.to_vec(),
        score: counts.score,
        correct_answers: counts.correct_answers,
        wrong_answers: counts.wrong_answers,
        not_answered: counts.not_answered,
        attempt,
        created_at: now,
    })
}
