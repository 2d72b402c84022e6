// src/models/attempt.rs

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};

use crate::models::question::{PublicOption, QuestionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "attempt_status", rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Submitted,
    Expired,
}

/// A submitted answer.
///
/// Choice questions accept either a single option id or a list of ids;
/// short answers accept text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Choices(Vec<String>),
    Text(String),
}

impl AnswerValue {
    /// Blank answers never count as answered (and are never penalized).
    pub fn is_blank(&self) -> bool {
        match self {
            AnswerValue::Choices(ids) => ids.iter().all(|id| id.trim().is_empty()),
            AnswerValue::Text(text) => text.trim().is_empty(),
        }
    }

    /// Selected option ids, trimmed, sorted and deduplicated.
    pub fn selected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self {
            AnswerValue::Choices(ids) => ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            AnswerValue::Text(id) => vec![id.trim().to_string()],
        };
        ids.retain(|id| !id.is_empty());
        ids.sort();
        ids.dedup();
        ids
    }
}

/// A question as materialized into an attempt at start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptQuestion {
    pub question_id: i64,
    /// Display order of the option ids (shuffled when the exam asks for it).
    pub option_order: Vec<String>,
    /// (point override or points) times weight, frozen when the attempt started.
    pub max_score: f64,
}

/// Per-question grading result stored on a submitted attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedAnswer {
    pub question_id: i64,
    pub submitted: Option<AnswerValue>,
    pub is_correct: bool,
    pub score: f64,
    pub max_score: f64,
}

/// Represents the 'exam_attempts' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExamAttempt {
    pub id: i64,
    pub exam_id: i64,
    pub student_id: i64,
    pub attempt_number: i32,
    pub questions: Json<Vec<AttemptQuestion>>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub answers: Json<Vec<GradedAnswer>>,
    /// Final score after late penalty, clamped at zero.
    pub score: Option<f64>,
    /// Sum of max scores of every question in the exam.
    pub max_score: f64,
    pub passed: Option<bool>,
    pub is_late: bool,
}

impl ExamAttempt {
    pub fn is_in_progress(&self) -> bool {
        self.status == AttemptStatus::InProgress
    }

    pub fn has_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Fields of an attempt row about to be inserted as `in_progress`.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub exam_id: i64,
    pub student_id: i64,
    pub attempt_number: i32,
    pub questions: Vec<AttemptQuestion>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub max_score: f64,
}

/// Everything written when an attempt moves from `in_progress` to `submitted`.
#[derive(Debug, Clone)]
pub struct GradedSubmission {
    pub answers: Vec<GradedAnswer>,
    pub score: f64,
    pub max_score: f64,
    pub passed: bool,
    pub is_late: bool,
    pub submitted_at: DateTime<Utc>,
}

/// DTO for submitting an attempt.
///
/// Key: question id. Value: selected option id(s) or answer text.
#[derive(Debug, Deserialize)]
pub struct SubmitAttemptRequest {
    #[serde(default)]
    pub answers: HashMap<i64, AnswerValue>,
}

/// A question of an attempt as shown to the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptQuestionView {
    pub question_id: i64,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub content: String,
    pub options: Vec<PublicOption>,
    pub max_score: f64,
    pub submitted: Option<AnswerValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_option_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_answers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Attempt detail with score visibility and answer reveal policies applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptView {
    pub id: i64,
    pub exam_id: i64,
    pub student_id: i64,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub is_late: bool,
    pub score: Option<f64>,
    pub max_score: Option<f64>,
    pub passed: Option<bool>,
    pub questions: Vec<AttemptQuestionView>,
}

/// Response of SubmitAttempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedSummary {
    pub attempt_id: i64,
    pub exam_id: i64,
    pub status: AttemptStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub is_late: bool,
    pub answered_count: usize,
    pub question_count: usize,
    pub score: Option<f64>,
    pub max_score: Option<f64>,
    pub passed: Option<bool>,
    pub correct_count: Option<usize>,
}
