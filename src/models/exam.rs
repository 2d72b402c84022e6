// src/models/exam.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "exam_status", rename_all = "snake_case")]
pub enum ExamStatus {
    Draft,
    Published,
    Archived,
}

/// How repeated attempts fold into the exam's standing score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "scoring_method", rename_all = "snake_case")]
pub enum ScoringMethod {
    Highest,
    Latest,
    Average,
}

/// When correct answers become visible to the student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "answer_reveal", rename_all = "snake_case")]
pub enum ShowCorrectAnswers {
    Never,
    AfterSubmit,
    AfterClose,
}

/// A question included in an exam, with exam-level weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRef {
    pub question_id: i64,
    pub order: i32,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub point_override: Option<f64>,
}

fn default_weight() -> f64 {
    1.0
}

/// Represents the 'exams' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExamDefinition {
    pub id: i64,
    pub course_id: i64,
    /// Section the exam gates; `None` for course-level exams.
    pub section_id: Option<i64>,
    pub title: String,
    pub question_refs: Json<Vec<QuestionRef>>,
    /// Derived: sum of (point override or question points) times weight.
    pub total_points: f64,
    pub passing_score: f64,
    pub duration_minutes: i32,
    /// `None` means unlimited attempts.
    pub max_attempts: Option<i32>,
    pub scoring_method: ScoringMethod,
    pub shuffle_questions: bool,
    pub shuffle_answers: bool,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
    pub allow_late_submission: bool,
    pub late_penalty_percent: f64,
    pub show_correct_answers: ShowCorrectAnswers,
    pub show_score_to_student: bool,
    pub status: ExamStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl ExamDefinition {
    /// Question refs in ascending `order`.
    pub fn ordered_refs(&self) -> Vec<QuestionRef> {
        let mut refs = self.question_refs.0.clone();
        refs.sort_by_key(|r| (r.order, r.question_id));
        refs
    }

    pub fn question_ids(&self) -> Vec<i64> {
        self.ordered_refs().iter().map(|r| r.question_id).collect()
    }

    pub fn find_ref(&self, question_id: i64) -> Option<&QuestionRef> {
        self.question_refs.iter().find(|r| r.question_id == question_id)
    }

    pub fn is_published(&self) -> bool {
        self.status == ExamStatus::Published
    }

    pub fn has_opened(&self, now: DateTime<Utc>) -> bool {
        self.open_at.is_none_or(|open| now >= open)
    }

    pub fn is_past_close(&self, now: DateTime<Utc>) -> bool {
        self.close_at.is_some_and(|close| now > close)
    }

    /// Whether correct answers may be shown for a finished attempt at `now`.
    pub fn reveals_correct_answers(&self, now: DateTime<Utc>) -> bool {
        match self.show_correct_answers {
            ShowCorrectAnswers::Never => false,
            ShowCorrectAnswers::AfterSubmit => true,
            ShowCorrectAnswers::AfterClose => self.is_past_close(now),
        }
    }
}

/// Fields of an exam row about to be inserted (always as a draft).
#[derive(Debug, Clone)]
pub struct NewExam {
    pub course_id: i64,
    pub section_id: Option<i64>,
    pub title: String,
    pub question_refs: Vec<QuestionRef>,
    pub total_points: f64,
    pub passing_score: f64,
    pub duration_minutes: i32,
    pub max_attempts: Option<i32>,
    pub scoring_method: ScoringMethod,
    pub shuffle_questions: bool,
    pub shuffle_answers: bool,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
    pub allow_late_submission: bool,
    pub late_penalty_percent: f64,
    pub show_correct_answers: ShowCorrectAnswers,
    pub show_score_to_student: bool,
}

/// DTO for creating an exam definition.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateExamRequest {
    pub course_id: i64,
    pub section_id: Option<i64>,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 500))]
    pub question_refs: Vec<QuestionRef>,
    #[validate(range(min = 0.0))]
    pub passing_score: f64,
    #[validate(range(min = 1, max = 1440))]
    pub duration_minutes: i32,
    #[validate(range(min = 1))]
    pub max_attempts: Option<i32>,
    #[serde(default = "default_scoring_method")]
    pub scoring_method: ScoringMethod,
    #[serde(default)]
    pub shuffle_questions: bool,
    #[serde(default)]
    pub shuffle_answers: bool,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allow_late_submission: bool,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub late_penalty_percent: f64,
    #[serde(default = "default_reveal")]
    pub show_correct_answers: ShowCorrectAnswers,
    #[serde(default = "default_true")]
    pub show_score_to_student: bool,
}

fn default_scoring_method() -> ScoringMethod {
    ScoringMethod::Highest
}

fn default_reveal() -> ShowCorrectAnswers {
    ShowCorrectAnswers::AfterSubmit
}

fn default_true() -> bool {
    true
}

/// Summary of one student's attempts on an exam.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptSummary {
    /// Submitted attempts; these count toward `max_attempts`.
    pub attempts_used: i64,
    pub attempts_remaining: Option<i64>,
    pub in_progress_attempt_id: Option<i64>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub best_score: Option<f64>,
    pub passed: Option<bool>,
}

/// Response of GetExamOverview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamOverview {
    pub id: i64,
    pub course_id: i64,
    pub section_id: Option<i64>,
    pub title: String,
    pub question_count: usize,
    pub total_points: f64,
    pub passing_score: f64,
    pub duration_minutes: i32,
    pub max_attempts: Option<i32>,
    pub scoring_method: ScoringMethod,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
    pub allow_late_submission: bool,
    pub late_penalty_percent: f64,
    pub show_correct_answers: ShowCorrectAnswers,
    pub attempts: AttemptSummary,
    pub can_start: bool,
    /// Why `can_start` is false.
    pub reason: Option<String>,
}
