// src/models/progress.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "progress_item", rename_all = "snake_case")]
pub enum ProgressItem {
    Lesson,
    Exam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "progress_status", rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
}

/// Represents the 'progress' table: one row per student and lesson or exam.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Progress {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub item_type: ProgressItem,
    pub item_id: i64,
    pub status: ProgressStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub exam_attempts: i32,
    pub exam_best_score: Option<f64>,
    pub exam_latest_score: Option<f64>,
    pub exam_passed: bool,
    pub exam_last_attempt_at: Option<DateTime<Utc>>,
}

/// Exam standing derived from every submitted attempt of one student.
#[derive(Debug, Clone, PartialEq)]
pub struct ExamStanding {
    pub student_id: i64,
    pub course_id: i64,
    pub exam_id: i64,
    pub attempts: i32,
    pub best_score: f64,
    pub latest_score: f64,
    pub passed: bool,
    pub last_attempt_at: DateTime<Utc>,
}
