// src/models/enrollment.rs

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};
use validator::Validate;

use crate::models::certificate::Certificate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Suspended,
    Expired,
}

/// Course shape and the student's achievements at the moment the enrollment
/// first reached 100%. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSnapshot {
    pub total_lessons: i32,
    pub total_exams: i32,
    pub completed_lesson_ids: Vec<i64>,
    pub completed_exam_ids: Vec<i64>,
    pub progress: i32,
    pub captured_at: DateTime<Utc>,
}

/// Represents the 'enrollments' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub completed_lesson_ids: Json<Vec<i64>>,
    /// Only exams verified as passed through their progress record.
    pub completed_exam_ids: Json<Vec<i64>>,
    /// Published lessons at the last recompute (drafts excluded).
    pub total_lessons: i32,
    /// Published exams of the course at the last recompute.
    pub total_exams: i32,
    /// Percentage, 0..=100.
    pub progress: i32,
    pub status: EnrollmentStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub completion_snapshot: Option<Json<CompletionSnapshot>>,
    pub certificate_issued: bool,
    /// Bumped on every write; recomputes only land on the version they read.
    pub version: i64,
    pub enrolled_at: DateTime<Utc>,
}

impl Enrollment {
    /// Whether the student may access course content and exams.
    pub fn grants_access(&self) -> bool {
        matches!(
            self.status,
            EnrollmentStatus::Active | EnrollmentStatus::Completed
        )
    }
}

/// Fresh read of everything the progress percentage depends on.
#[derive(Debug, Clone, Default)]
pub struct CourseTally {
    pub published_lesson_ids: Vec<i64>,
    pub required_exam_ids: Vec<i64>,
    /// Lessons with a completed progress record for the student.
    pub completed_lesson_ids: Vec<i64>,
    /// Exams whose progress record says `exam_passed`.
    pub passed_exam_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentEffect {
    IssueCertificate,
}

/// Result of an enrollment recompute: the state to write plus follow-up work.
#[derive(Debug, Clone)]
pub struct Recomputed {
    pub enrollment: Enrollment,
    pub effects: Vec<EnrollmentEffect>,
    /// True when this recompute moved the enrollment to `completed`.
    pub newly_completed: bool,
}

/// `round(100 * completed / total)`, or 0 for an empty course.
pub fn progress_percent(completed: usize, total: usize) -> i32 {
    if total == 0 {
        return 0;
    }
    let pct = (100.0 * completed as f64 / total as f64).round() as i32;
    pct.clamp(0, 100)
}

impl Enrollment {
    /// Pure recompute: takes the current row and a fresh tally, returns the next
    /// row and the effects to emit. Does not touch `version`.
    pub fn recompute(&self, tally: &CourseTally, now: DateTime<Utc>) -> Recomputed {
        let mut next = self.clone();

        let mut completed_lessons: Vec<i64> = self.completed_lesson_ids.0.clone();
        for id in &tally.completed_lesson_ids {
            if !completed_lessons.contains(id) {
                completed_lessons.push(*id);
            }
        }

        // Self-healing: drop exam ids that no longer have a passed progress record.
        let passed: HashSet<i64> = tally.passed_exam_ids.iter().copied().collect();
        let mut completed_exams: Vec<i64> = self
            .completed_exam_ids
            .iter()
            .copied()
            .filter(|id| passed.contains(id))
            .collect();
        for id in &tally.passed_exam_ids {
            if !completed_exams.contains(id) {
                completed_exams.push(*id);
            }
        }

        let published: HashSet<i64> = tally.published_lesson_ids.iter().copied().collect();
        let required: HashSet<i64> = tally.required_exam_ids.iter().copied().collect();

        let lessons_done = completed_lessons.iter().filter(|id| published.contains(id)).count();
        let exams_done = completed_exams.iter().filter(|id| required.contains(id)).count();
        let total = published.len() + required.len();

        next.completed_lesson_ids = Json(completed_lessons);
        next.completed_exam_ids = Json(completed_exams);
        next.total_lessons = published.len() as i32;
        next.total_exams = required.len() as i32;
        next.progress = progress_percent(lessons_done + exams_done, total);

        let mut effects = Vec::new();
        let mut newly_completed = false;

        if next.progress >= 100 && self.status == EnrollmentStatus::Active {
            next.status = EnrollmentStatus::Completed;
            next.completed_at = Some(now);
            newly_completed = true;
            if next.completion_snapshot.is_none() {
                next.completion_snapshot = Some(Json(CompletionSnapshot {
                    total_lessons: next.total_lessons,
                    total_exams: next.total_exams,
                    completed_lesson_ids: next.completed_lesson_ids.0.clone(),
                    completed_exam_ids: next.completed_exam_ids.0.clone(),
                    progress: next.progress,
                    captured_at: now,
                }));
            }
        }

        if next.status == EnrollmentStatus::Completed && !next.certificate_issued {
            effects.push(EnrollmentEffect::IssueCertificate);
        }

        Recomputed {
            enrollment: next,
            effects,
            newly_completed,
        }
    }
}

/// DTO for creating an enrollment once payment is confirmed upstream.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateEnrollmentRequest {
    #[validate(range(min = 1))]
    pub student_id: i64,
    #[validate(range(min = 1))]
    pub course_id: i64,
}

/// Response of GetMyEnrollment.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollmentResponse {
    pub enrollment: Enrollment,
    pub certificate: Option<Certificate>,
}
