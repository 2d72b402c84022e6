// src/models/course.rs
//
// Catalog records owned by the course CRUD subsystem. Read-only here.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "lesson_status", rename_all = "snake_case")]
pub enum LessonStatus {
    Draft,
    Published,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Section {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    #[sqlx(rename = "position")]
    pub order: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lesson {
    pub id: i64,
    pub course_id: i64,
    pub section_id: i64,
    pub title: String,
    #[sqlx(rename = "position")]
    pub order: i32,
    pub status: LessonStatus,
}

impl Lesson {
    pub fn is_published(&self) -> bool {
        self.status == LessonStatus::Published
    }
}
