// src/models/question.rs

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};
use validator::Validate;

use crate::error::AppError;

/// Question kinds understood by the grading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "question_type", rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    ShortAnswer,
}

/// One selectable option of a choice question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

/// One accepted answer of a short-answer question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedAnswer {
    pub text: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Represents the 'questions' table in the database.
///
/// Rows are never updated in place except for the `is_archived` flag.
/// Editing a question inserts a new version pointing back at its parent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,

    /// Mapped from the database column 'type' since `type` is a reserved keyword in Rust.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub question_type: QuestionType,

    /// The text content of the question.
    pub content: String,

    /// Options for choice questions, empty for short answers.
    pub options: Json<Vec<QuestionOption>>,

    /// Accepted answers for short-answer questions, empty for choice questions.
    pub expected_answers: Json<Vec<ExpectedAnswer>>,

    /// Base point value before exam-level weighting.
    pub points: f64,

    pub negative_marking: bool,

    /// Deducted (times the exam weight) for a wrong, non-blank answer.
    pub negative_points: f64,

    /// Explanation shown when correct answers are revealed.
    pub explanation: Option<String>,

    pub version: i32,

    /// The question this one is a revision of.
    pub parent_id: Option<i64>,

    pub is_archived: bool,

    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Question {
    /// Ids of the options flagged as correct, sorted.
    pub fn correct_option_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .options
            .iter()
            .filter(|o| o.is_correct)
            .map(|o| o.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn option_ids(&self) -> Vec<String> {
        self.options.iter().map(|o| o.id.clone()).collect()
    }
}

/// Answer-key invariants every stored question satisfies.
///
/// * single_choice: exactly one correct option.
/// * multiple_choice: at least one correct option.
/// * short_answer: at least one non-blank expected answer.
pub fn validate_answer_key(
    question_type: QuestionType,
    options: &[QuestionOption],
    expected_answers: &[ExpectedAnswer],
) -> Result<(), AppError> {
    let mut seen = std::collections::HashSet::new();
    for option in options {
        if option.id.trim().is_empty() {
            return Err(AppError::BadRequest("Option id cannot be empty".to_string()));
        }
        if option.id != option.id.trim() {
            return Err(AppError::BadRequest(format!(
                "Option id '{}' has surrounding whitespace",
                option.id
            )));
        }
        if !seen.insert(option.id.as_str()) {
            return Err(AppError::BadRequest(format!(
                "Duplicate option id '{}'",
                option.id
            )));
        }
    }

    let correct = options.iter().filter(|o| o.is_correct).count();
    match question_type {
        QuestionType::SingleChoice => {
            if options.len() < 2 {
                return Err(AppError::BadRequest(
                    "Single choice questions need at least two options".to_string(),
                ));
            }
            if correct != 1 {
                return Err(AppError::BadRequest(
                    "Single choice questions must have exactly one correct option".to_string(),
                ));
            }
        }
        QuestionType::MultipleChoice => {
            if options.len() < 2 {
                return Err(AppError::BadRequest(
                    "Multiple choice questions need at least two options".to_string(),
                ));
            }
            if correct == 0 {
                return Err(AppError::BadRequest(
                    "Multiple choice questions must have at least one correct option".to_string(),
                ));
            }
        }
        QuestionType::ShortAnswer => {
            if !options.is_empty() {
                return Err(AppError::BadRequest(
                    "Short answer questions cannot have options".to_string(),
                ));
            }
            if expected_answers.iter().all(|a| a.text.trim().is_empty()) {
                return Err(AppError::BadRequest(
                    "Short answer questions must have at least one expected answer".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Fields of a question row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub question_type: QuestionType,
    pub content: String,
    pub options: Vec<QuestionOption>,
    pub expected_answers: Vec<ExpectedAnswer>,
    pub points: f64,
    pub negative_marking: bool,
    pub negative_points: f64,
    pub explanation: Option<String>,
    pub version: i32,
    pub parent_id: Option<i64>,
}

/// Option as shown to a student (no correctness flag).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicOption {
    pub id: String,
    pub text: String,
}

/// DTO for creating a new question or a revision of one.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateQuestionRequest {
    pub question_type: QuestionType,
    #[validate(length(min = 1, max = 2000))]
    pub content: String,
    #[validate(custom(function = validate_options))]
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub expected_answers: Vec<ExpectedAnswer>,
    #[validate(range(exclusive_min = 0.0, max = 1000.0))]
    pub points: f64,
    #[serde(default)]
    pub negative_marking: bool,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1000.0))]
    pub negative_points: f64,
    #[validate(length(max = 4000))]
    pub explanation: Option<String>,
}

fn validate_options(options: &[QuestionOption]) -> Result<(), validator::ValidationError> {
    if options.len() > 20 {
        return Err(validator::ValidationError::new("too_many_options"));
    }
    for opt in options {
        if opt.text.len() > 500 || opt.id.len() > 50 {
            return Err(validator::ValidationError::new("option_too_long"));
        }
    }
    Ok(())
}

impl CreateQuestionRequest {
    /// Validates shape and answer key, producing the row to insert.
    pub fn into_new_question(
        self,
        version: i32,
        parent_id: Option<i64>,
    ) -> Result<NewQuestion, AppError> {
        self.validate()?;
        validate_answer_key(self.question_type, &self.options, &self.expected_answers)?;

        Ok(NewQuestion {
            question_type: self.question_type,
            content: self.content,
            options: self.options,
            expected_answers: self.expected_answers,
            points: self.points,
            negative_marking: self.negative_marking,
            negative_points: self.negative_points,
            explanation: self.explanation,
            version,
            parent_id,
        })
    }
}
