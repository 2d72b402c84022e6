// src/repository/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, types::Json};

use crate::{
    error::AppError,
    models::{
        attempt::{ExamAttempt, GradedSubmission, NewAttempt},
        certificate::{Certificate, NewCertificate},
        course::{Course, Lesson, Section},
        enrollment::Enrollment,
        exam::{ExamDefinition, ExamStatus, NewExam},
        progress::{ExamStanding, Progress},
        question::{NewQuestion, Question},
    },
    repository::{
        AttemptRepository, CertificateRepository, CourseRepository, EnrollmentRepository,
        ExamRepository, ProgressRepository, QuestionRepository,
    },
};

const QUESTION_COLUMNS: &str = "id, type, content, options, expected_answers, points, \
    negative_marking, negative_points, explanation, version, parent_id, is_archived, created_at";

const EXAM_COLUMNS: &str = "id, course_id, section_id, title, question_refs, total_points, \
    passing_score, duration_minutes, max_attempts, scoring_method, shuffle_questions, \
    shuffle_answers, open_at, close_at, allow_late_submission, late_penalty_percent, \
    show_correct_answers, show_score_to_student, status, created_at";

const ATTEMPT_COLUMNS: &str = "id, exam_id, student_id, attempt_number, questions, started_at, \
    expires_at, submitted_at, status, answers, score, max_score, passed, is_late";

const PROGRESS_COLUMNS: &str = "id, student_id, course_id, item_type, item_id, status, \
    completed_at, exam_attempts, exam_best_score, exam_latest_score, exam_passed, \
    exam_last_attempt_at";

const ENROLLMENT_COLUMNS: &str = "id, student_id, course_id, completed_lesson_ids, \
    completed_exam_ids, total_lessons, total_exams, progress, status, completed_at, \
    completion_snapshot, certificate_issued, version, enrolled_at";

const CERTIFICATE_COLUMNS: &str = "id, enrollment_id, student_id, course_id, code, snapshot, \
    status, asset_html, generation_attempts, last_error, issued_at, generated_at";

/// Postgres 23505: unique_violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuestionRepository for PgStore {
    async fn insert(&self, question: NewQuestion) -> Result<Question, AppError> {
        let row = sqlx::query_as::<_, Question>(&format!(
            r#"
            INSERT INTO questions
            (type, content, options, expected_answers, points, negative_marking,
             negative_points, explanation, version, parent_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {QUESTION_COLUMNS}
            "#
        ))
        .bind(question.question_type)
        .bind(question.content)
        .bind(Json(question.options))
        .bind(Json(question.expected_answers))
        .bind(question.points)
        .bind(question.negative_marking)
        .bind(question.negative_points)
        .bind(question.explanation)
        .bind(question.version)
        .bind(question.parent_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to insert question: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        Ok(row)
    }

    async fn find(&self, id: i64) -> Result<Option<Question>, AppError> {
        let row = sqlx::query_as::<_, Question>(&format!(
            "SELECT {QUESTION_COLUMNS} FROM questions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_many(&self, ids: &[i64]) -> Result<Vec<Question>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // Dynamic IN clause
        let mut query_builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {QUESTION_COLUMNS} FROM questions WHERE id IN ("
        ));
        let mut separated = query_builder.separated(",");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows: Vec<Question> = query_builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn archive(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE questions SET is_archived = TRUE WHERE id = $1 AND is_archived = FALSE",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ExamRepository for PgStore {
    async fn insert(&self, exam: NewExam) -> Result<ExamDefinition, AppError> {
        let row = sqlx::query_as::<_, ExamDefinition>(&format!(
            r#"
            INSERT INTO exams
            (course_id, section_id, title, question_refs, total_points, passing_score,
             duration_minutes, max_attempts, scoring_method, shuffle_questions, shuffle_answers,
             open_at, close_at, allow_late_submission, late_penalty_percent,
             show_correct_answers, show_score_to_student, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, 'draft')
            RETURNING {EXAM_COLUMNS}
            "#
        ))
        .bind(exam.course_id)
        .bind(exam.section_id)
        .bind(exam.title)
        .bind(Json(exam.question_refs))
        .bind(exam.total_points)
        .bind(exam.passing_score)
        .bind(exam.duration_minutes)
        .bind(exam.max_attempts)
        .bind(exam.scoring_method)
        .bind(exam.shuffle_questions)
        .bind(exam.shuffle_answers)
        .bind(exam.open_at)
        .bind(exam.close_at)
        .bind(exam.allow_late_submission)
        .bind(exam.late_penalty_percent)
        .bind(exam.show_correct_answers)
        .bind(exam.show_score_to_student)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to insert exam: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        Ok(row)
    }

    async fn find(&self, id: i64) -> Result<Option<ExamDefinition>, AppError> {
        let row = sqlx::query_as::<_, ExamDefinition>(&format!(
            "SELECT {EXAM_COLUMNS} FROM exams WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_by_course(&self, course_id: i64) -> Result<Vec<ExamDefinition>, AppError> {
        let rows = sqlx::query_as::<_, ExamDefinition>(&format!(
            "SELECT {EXAM_COLUMNS} FROM exams WHERE course_id = $1 ORDER BY id"
        ))
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn transition_status(
        &self,
        id: i64,
        from: ExamStatus,
        to: ExamStatus,
    ) -> Result<Option<ExamDefinition>, AppError> {
        let row = sqlx::query_as::<_, ExamDefinition>(&format!(
            "UPDATE exams SET status = $3 WHERE id = $1 AND status = $2 RETURNING {EXAM_COLUMNS}"
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl AttemptRepository for PgStore {
    async fn find(&self, id: i64) -> Result<Option<ExamAttempt>, AppError> {
        let row = sqlx::query_as::<_, ExamAttempt>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM exam_attempts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_in_progress(
        &self,
        exam_id: i64,
        student_id: i64,
    ) -> Result<Option<ExamAttempt>, AppError> {
        let row = sqlx::query_as::<_, ExamAttempt>(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS} FROM exam_attempts
            WHERE exam_id = $1 AND student_id = $2 AND status = 'in_progress'
            "#
        ))
        .bind(exam_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn create_or_resume(&self, attempt: NewAttempt) -> Result<(ExamAttempt, bool), AppError> {
        // The partial unique index on (exam_id, student_id) WHERE status = 'in_progress'
        // turns a concurrent second insert into a no-op. The loser then reads the winner.
        // A few rounds cover the winner being submitted between our insert and read.
        for _ in 0..3 {
            let inserted = sqlx::query_as::<_, ExamAttempt>(&format!(
                r#"
                INSERT INTO exam_attempts
                (exam_id, student_id, attempt_number, questions, started_at, expires_at,
                 status, answers, max_score, is_late)
                VALUES ($1, $2, $3, $4, $5, $6, 'in_progress', '[]'::jsonb, $7, FALSE)
                ON CONFLICT (exam_id, student_id) WHERE status = 'in_progress' DO NOTHING
                RETURNING {ATTEMPT_COLUMNS}
                "#
            ))
            .bind(attempt.exam_id)
            .bind(attempt.student_id)
            .bind(attempt.attempt_number)
            .bind(Json(&attempt.questions))
            .bind(attempt.started_at)
            .bind(attempt.expires_at)
            .bind(attempt.max_score)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to insert attempt: {:?}", e);
                AppError::InternalServerError(e.to_string())
            })?;

            if let Some(row) = inserted {
                return Ok((row, true));
            }

            if let Some(existing) = self
                .find_in_progress(attempt.exam_id, attempt.student_id)
                .await?
            {
                return Ok((existing, false));
            }
        }

        Err(AppError::Conflict(
            "Could not start attempt, please retry".to_string(),
        ))
    }

    async fn list_for_student(
        &self,
        exam_id: i64,
        student_id: i64,
    ) -> Result<Vec<ExamAttempt>, AppError> {
        let rows = sqlx::query_as::<_, ExamAttempt>(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS} FROM exam_attempts
            WHERE exam_id = $1 AND student_id = $2
            ORDER BY started_at, id
            "#
        ))
        .bind(exam_id)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn complete(
        &self,
        id: i64,
        submission: GradedSubmission,
    ) -> Result<Option<ExamAttempt>, AppError> {
        let row = sqlx::query_as::<_, ExamAttempt>(&format!(
            r#"
            UPDATE exam_attempts SET
                status = 'submitted',
                answers = $2,
                score = $3,
                max_score = $4,
                passed = $5,
                is_late = $6,
                submitted_at = $7
            WHERE id = $1 AND status = 'in_progress'
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(Json(submission.answers))
        .bind(submission.score)
        .bind(submission.max_score)
        .bind(submission.passed)
        .bind(submission.is_late)
        .bind(submission.submitted_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to record submission: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        Ok(row)
    }

    async fn expire(&self, id: i64) -> Result<Option<ExamAttempt>, AppError> {
        let row = sqlx::query_as::<_, ExamAttempt>(&format!(
            r#"
            UPDATE exam_attempts SET status = 'expired'
            WHERE id = $1 AND status = 'in_progress'
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl ProgressRepository for PgStore {
    async fn find_exam(&self, student_id: i64, exam_id: i64) -> Result<Option<Progress>, AppError> {
        let row = sqlx::query_as::<_, Progress>(&format!(
            r#"
            SELECT {PROGRESS_COLUMNS} FROM progress
            WHERE student_id = $1 AND item_type = 'exam' AND item_id = $2
            "#
        ))
        .bind(student_id)
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn complete_lesson(
        &self,
        student_id: i64,
        course_id: i64,
        lesson_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Progress, AppError> {
        let row = sqlx::query_as::<_, Progress>(&format!(
            r#"
            INSERT INTO progress (student_id, course_id, item_type, item_id, status, completed_at)
            VALUES ($1, $2, 'lesson', $3, 'completed', $4)
            ON CONFLICT (student_id, item_type, item_id) DO UPDATE SET
                status = 'completed',
                completed_at = COALESCE(progress.completed_at, EXCLUDED.completed_at)
            RETURNING {PROGRESS_COLUMNS}
            "#
        ))
        .bind(student_id)
        .bind(course_id)
        .bind(lesson_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to upsert lesson progress: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        Ok(row)
    }

    async fn upsert_exam(&self, standing: ExamStanding) -> Result<Progress, AppError> {
        let row = sqlx::query_as::<_, Progress>(&format!(
            r#"
            INSERT INTO progress
            (student_id, course_id, item_type, item_id, status, completed_at, exam_attempts,
             exam_best_score, exam_latest_score, exam_passed, exam_last_attempt_at)
            VALUES ($1, $2, 'exam', $3,
                    CASE WHEN $7 THEN 'completed'::progress_status ELSE 'in_progress'::progress_status END,
                    CASE WHEN $7 THEN $8 END,
                    $4, $5, $6, $7, $8)
            ON CONFLICT (student_id, item_type, item_id) DO UPDATE SET
                status = EXCLUDED.status,
                completed_at = CASE WHEN EXCLUDED.exam_passed
                    THEN COALESCE(progress.completed_at, EXCLUDED.completed_at) END,
                exam_attempts = EXCLUDED.exam_attempts,
                exam_best_score = EXCLUDED.exam_best_score,
                exam_latest_score = EXCLUDED.exam_latest_score,
                exam_passed = EXCLUDED.exam_passed,
                exam_last_attempt_at = EXCLUDED.exam_last_attempt_at
            RETURNING {PROGRESS_COLUMNS}
            "#
        ))
        .bind(standing.student_id)
        .bind(standing.course_id)
        .bind(standing.exam_id)
        .bind(standing.attempts)
        .bind(standing.best_score)
        .bind(standing.latest_score)
        .bind(standing.passed)
        .bind(standing.last_attempt_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to upsert exam progress: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        Ok(row)
    }

    async fn list_for_course(&self, student_id: i64, course_id: i64) -> Result<Vec<Progress>, AppError> {
        let rows = sqlx::query_as::<_, Progress>(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress WHERE student_id = $1 AND course_id = $2 ORDER BY id"
        ))
        .bind(student_id)
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl EnrollmentRepository for PgStore {
    async fn insert(
        &self,
        student_id: i64,
        course_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, AppError> {
        let row = sqlx::query_as::<_, Enrollment>(&format!(
            r#"
            INSERT INTO enrollments (student_id, course_id, enrolled_at)
            VALUES ($1, $2, $3)
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        ))
        .bind(student_id)
        .bind(course_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!(
                    "Student {} is already enrolled in course {}",
                    student_id, course_id
                ))
            } else {
                tracing::error!("Failed to create enrollment: {:?}", e);
                AppError::InternalServerError(e.to_string())
            }
        })?;

        Ok(row)
    }

    async fn find(&self, id: i64) -> Result<Option<Enrollment>, AppError> {
        let row = sqlx::query_as::<_, Enrollment>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_student_course(
        &self,
        student_id: i64,
        course_id: i64,
    ) -> Result<Option<Enrollment>, AppError> {
        let row = sqlx::query_as::<_, Enrollment>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE student_id = $1 AND course_id = $2"
        ))
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn save_if_version(&self, enrollment: &Enrollment) -> Result<Option<Enrollment>, AppError> {
        // certificate_issued is owned by issue_once; the snapshot is write-once.
        let row = sqlx::query_as::<_, Enrollment>(&format!(
            r#"
            UPDATE enrollments SET
                completed_lesson_ids = $3,
                completed_exam_ids = $4,
                total_lessons = $5,
                total_exams = $6,
                progress = $7,
                status = $8,
                completed_at = $9,
                completion_snapshot = COALESCE(completion_snapshot, $10),
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        ))
        .bind(enrollment.id)
        .bind(enrollment.version)
        .bind(&enrollment.completed_lesson_ids)
        .bind(&enrollment.completed_exam_ids)
        .bind(enrollment.total_lessons)
        .bind(enrollment.total_exams)
        .bind(enrollment.progress)
        .bind(enrollment.status)
        .bind(enrollment.completed_at)
        .bind(&enrollment.completion_snapshot)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM enrollments WHERE id = $1")
                .bind(enrollment.id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(AppError::NotFound("Enrollment not found".to_string()));
            }
        }

        Ok(row)
    }
}

#[async_trait]
impl CourseRepository for PgStore {
    async fn find_course(&self, id: i64) -> Result<Option<Course>, AppError> {
        let row = sqlx::query_as::<_, Course>("SELECT id, title FROM courses WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn sections(&self, course_id: i64) -> Result<Vec<Section>, AppError> {
        let rows = sqlx::query_as::<_, Section>(
            "SELECT id, course_id, title, position FROM sections WHERE course_id = $1 ORDER BY position, id",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_section(&self, id: i64) -> Result<Option<Section>, AppError> {
        let row = sqlx::query_as::<_, Section>(
            "SELECT id, course_id, title, position FROM sections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn lessons(&self, course_id: i64) -> Result<Vec<Lesson>, AppError> {
        let rows = sqlx::query_as::<_, Lesson>(
            r#"
            SELECT id, course_id, section_id, title, position, status
            FROM lessons WHERE course_id = $1
            ORDER BY position, id
            "#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_lesson(&self, id: i64) -> Result<Option<Lesson>, AppError> {
        let row = sqlx::query_as::<_, Lesson>(
            "SELECT id, course_id, section_id, title, position, status FROM lessons WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl CertificateRepository for PgStore {
    async fn issue_once(&self, certificate: NewCertificate) -> Result<Option<Certificate>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::InternalServerError(e.to_string()))?;

        // Check-and-set; a second trigger finds the flag already raised.
        let claimed = sqlx::query(
            r#"
            UPDATE enrollments SET certificate_issued = TRUE, version = version + 1
            WHERE id = $1 AND certificate_issued = FALSE
            "#,
        )
        .bind(certificate.enrollment_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query_as::<_, Certificate>(&format!(
            r#"
            INSERT INTO certificates
            (enrollment_id, student_id, course_id, code, snapshot, status, issued_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            RETURNING {CERTIFICATE_COLUMNS}
            "#
        ))
        .bind(certificate.enrollment_id)
        .bind(certificate.student_id)
        .bind(certificate.course_id)
        .bind(&certificate.code)
        .bind(Json(&certificate.snapshot))
        .bind(certificate.issued_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!("Failed to insert certificate: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| AppError::InternalServerError(e.to_string()))?;

        Ok(Some(row))
    }

    async fn find(&self, id: i64) -> Result<Option<Certificate>, AppError> {
        let row = sqlx::query_as::<_, Certificate>(&format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certificates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_enrollment(&self, enrollment_id: i64) -> Result<Option<Certificate>, AppError> {
        let row = sqlx::query_as::<_, Certificate>(&format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certificates WHERE enrollment_id = $1"
        ))
        .bind(enrollment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn mark_generated(
        &self,
        id: i64,
        asset_html: String,
        now: DateTime<Utc>,
    ) -> Result<Certificate, AppError> {
        let row = sqlx::query_as::<_, Certificate>(&format!(
            r#"
            UPDATE certificates SET
                status = 'generated',
                asset_html = $2,
                generation_attempts = generation_attempts + 1,
                last_error = NULL,
                generated_at = $3
            WHERE id = $1
            RETURNING {CERTIFICATE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(asset_html)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Certificate not found".to_string()))?;

        Ok(row)
    }

    async fn mark_failed(&self, id: i64, error: String) -> Result<Certificate, AppError> {
        let row = sqlx::query_as::<_, Certificate>(&format!(
            r#"
            UPDATE certificates SET
                status = 'failed',
                generation_attempts = generation_attempts + 1,
                last_error = $2
            WHERE id = $1
            RETURNING {CERTIFICATE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Certificate not found".to_string()))?;

        Ok(row)
    }
}
