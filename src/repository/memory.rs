// src/repository/memory.rs
//
// Single-mutex store implementing every repository trait. Each trait method
// runs under one lock acquisition, which gives it the same atomicity the
// Postgres store gets from conditional statements.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::types::Json;

use crate::{
    error::AppError,
    models::{
        attempt::{AttemptStatus, ExamAttempt, GradedSubmission, NewAttempt},
        certificate::{Certificate, CertificateStatus, NewCertificate},
        course::{Course, Lesson, LessonStatus, Section},
        enrollment::{Enrollment, EnrollmentStatus},
        exam::{ExamDefinition, ExamStatus, NewExam},
        progress::{ExamStanding, Progress, ProgressItem, ProgressStatus},
        question::{NewQuestion, Question},
    },
    repository::{
        AttemptRepository, CertificateRepository, CourseRepository, EnrollmentRepository,
        ExamRepository, ProgressRepository, QuestionRepository,
    },
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    courses: BTreeMap<i64, Course>,
    sections: BTreeMap<i64, Section>,
    lessons: BTreeMap<i64, Lesson>,
    questions: BTreeMap<i64, Question>,
    exams: BTreeMap<i64, ExamDefinition>,
    attempts: BTreeMap<i64, ExamAttempt>,
    progress: BTreeMap<i64, Progress>,
    enrollments: BTreeMap<i64, Enrollment>,
    certificates: BTreeMap<i64, Certificate>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Catalog content loaded into a memory store at startup.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub courses: Vec<Course>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|_| AppError::InternalServerError("memory store lock poisoned".to_string()))
    }

    /// Loads catalog rows, keeping their ids.
    pub fn load_catalog(&self, seed: CatalogSeed) -> Result<(), AppError> {
        let mut t = self.tables()?;
        let mut max_id = t.next_id;
        for course in seed.courses {
            max_id = max_id.max(course.id);
            t.courses.insert(course.id, course);
        }
        for section in seed.sections {
            max_id = max_id.max(section.id);
            t.sections.insert(section.id, section);
        }
        for lesson in seed.lessons {
            max_id = max_id.max(lesson.id);
            t.lessons.insert(lesson.id, lesson);
        }
        t.next_id = max_id;
        Ok(())
    }

    pub fn add_course(&self, title: &str) -> Result<Course, AppError> {
        let mut t = self.tables()?;
        let course = Course {
            id: t.next_id(),
            title: title.to_string(),
        };
        t.courses.insert(course.id, course.clone());
        Ok(course)
    }

    pub fn add_section(&self, course_id: i64, title: &str, order: i32) -> Result<Section, AppError> {
        let mut t = self.tables()?;
        let section = Section {
            id: t.next_id(),
            course_id,
            title: title.to_string(),
            order,
        };
        t.sections.insert(section.id, section.clone());
        Ok(section)
    }

    pub fn add_lesson(
        &self,
        section: &Section,
        title: &str,
        order: i32,
        status: LessonStatus,
    ) -> Result<Lesson, AppError> {
        let mut t = self.tables()?;
        let lesson = Lesson {
            id: t.next_id(),
            course_id: section.course_id,
            section_id: section.id,
            title: title.to_string(),
            order,
            status,
        };
        t.lessons.insert(lesson.id, lesson.clone());
        Ok(lesson)
    }

    pub fn remove_section(&self, section_id: i64) -> Result<(), AppError> {
        self.tables()?.sections.remove(&section_id);
        Ok(())
    }
}

#[async_trait]
impl QuestionRepository for MemoryStore {
    async fn insert(&self, question: NewQuestion) -> Result<Question, AppError> {
        let mut t = self.tables()?;
        let row = Question {
            id: t.next_id(),
            question_type: question.question_type,
            content: question.content,
            options: Json(question.options),
            expected_answers: Json(question.expected_answers),
            points: question.points,
            negative_marking: question.negative_marking,
            negative_points: question.negative_points,
            explanation: question.explanation,
            version: question.version,
            parent_id: question.parent_id,
            is_archived: false,
            created_at: Some(Utc::now()),
        };
        t.questions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find(&self, id: i64) -> Result<Option<Question>, AppError> {
        Ok(self.tables()?.questions.get(&id).cloned())
    }

    async fn find_many(&self, ids: &[i64]) -> Result<Vec<Question>, AppError> {
        let t = self.tables()?;
        Ok(ids.iter().filter_map(|id| t.questions.get(id).cloned()).collect())
    }

    async fn archive(&self, id: i64) -> Result<bool, AppError> {
        let mut t = self.tables()?;
        match t.questions.get_mut(&id) {
            Some(q) if !q.is_archived => {
                q.is_archived = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ExamRepository for MemoryStore {
    async fn insert(&self, exam: NewExam) -> Result<ExamDefinition, AppError> {
        let mut t = self.tables()?;
        let row = ExamDefinition {
            id: t.next_id(),
            course_id: exam.course_id,
            section_id: exam.section_id,
            title: exam.title,
            question_refs: Json(exam.question_refs),
            total_points: exam.total_points,
            passing_score: exam.passing_score,
            duration_minutes: exam.duration_minutes,
            max_attempts: exam.max_attempts,
            scoring_method: exam.scoring_method,
            shuffle_questions: exam.shuffle_questions,
            shuffle_answers: exam.shuffle_answers,
            open_at: exam.open_at,
            close_at: exam.close_at,
            allow_late_submission: exam.allow_late_submission,
            late_penalty_percent: exam.late_penalty_percent,
            show_correct_answers: exam.show_correct_answers,
            show_score_to_student: exam.show_score_to_student,
            status: ExamStatus::Draft,
            created_at: Some(Utc::now()),
        };
        t.exams.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find(&self, id: i64) -> Result<Option<ExamDefinition>, AppError> {
        Ok(self.tables()?.exams.get(&id).cloned())
    }

    async fn list_by_course(&self, course_id: i64) -> Result<Vec<ExamDefinition>, AppError> {
        Ok(self
            .tables()?
            .exams
            .values()
            .filter(|e| e.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn transition_status(
        &self,
        id: i64,
        from: ExamStatus,
        to: ExamStatus,
    ) -> Result<Option<ExamDefinition>, AppError> {
        let mut t = self.tables()?;
        match t.exams.get_mut(&id) {
            Some(exam) if exam.status == from => {
                exam.status = to;
                Ok(Some(exam.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl AttemptRepository for MemoryStore {
    async fn find(&self, id: i64) -> Result<Option<ExamAttempt>, AppError> {
        Ok(self.tables()?.attempts.get(&id).cloned())
    }

    async fn find_in_progress(
        &self,
        exam_id: i64,
        student_id: i64,
    ) -> Result<Option<ExamAttempt>, AppError> {
        Ok(self
            .tables()?
            .attempts
            .values()
            .find(|a| a.exam_id == exam_id && a.student_id == student_id && a.is_in_progress())
            .cloned())
    }

    async fn create_or_resume(&self, attempt: NewAttempt) -> Result<(ExamAttempt, bool), AppError> {
        let mut t = self.tables()?;
        if let Some(existing) = t.attempts.values().find(|a| {
            a.exam_id == attempt.exam_id && a.student_id == attempt.student_id && a.is_in_progress()
        }) {
            return Ok((existing.clone(), false));
        }

        let row = ExamAttempt {
            id: t.next_id(),
            exam_id: attempt.exam_id,
            student_id: attempt.student_id,
            attempt_number: attempt.attempt_number,
            questions: Json(attempt.questions),
            started_at: attempt.started_at,
            expires_at: attempt.expires_at,
            submitted_at: None,
            status: AttemptStatus::InProgress,
            answers: Json(Vec::new()),
            score: None,
            max_score: attempt.max_score,
            passed: None,
            is_late: false,
        };
        t.attempts.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn list_for_student(
        &self,
        exam_id: i64,
        student_id: i64,
    ) -> Result<Vec<ExamAttempt>, AppError> {
        Ok(self
            .tables()?
            .attempts
            .values()
            .filter(|a| a.exam_id == exam_id && a.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn complete(
        &self,
        id: i64,
        submission: GradedSubmission,
    ) -> Result<Option<ExamAttempt>, AppError> {
        let mut t = self.tables()?;
        match t.attempts.get_mut(&id) {
            Some(attempt) if attempt.is_in_progress() => {
                attempt.status = AttemptStatus::Submitted;
                attempt.answers = Json(submission.answers);
                attempt.score = Some(submission.score);
                attempt.max_score = submission.max_score;
                attempt.passed = Some(submission.passed);
                attempt.is_late = submission.is_late;
                attempt.submitted_at = Some(submission.submitted_at);
                Ok(Some(attempt.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire(&self, id: i64) -> Result<Option<ExamAttempt>, AppError> {
        let mut t = self.tables()?;
        match t.attempts.get_mut(&id) {
            Some(attempt) if attempt.is_in_progress() => {
                attempt.status = AttemptStatus::Expired;
                Ok(Some(attempt.clone()))
            }
            _ => Ok(None),
        }
    }
}

fn find_progress_mut(
    t: &mut Tables,
    student_id: i64,
    item_type: ProgressItem,
    item_id: i64,
) -> Option<&mut Progress> {
    t.progress
        .values_mut()
        .find(|p| p.student_id == student_id && p.item_type == item_type && p.item_id == item_id)
}

#[async_trait]
impl ProgressRepository for MemoryStore {
    async fn find_exam(&self, student_id: i64, exam_id: i64) -> Result<Option<Progress>, AppError> {
        Ok(self
            .tables()?
            .progress
            .values()
            .find(|p| {
                p.student_id == student_id && p.item_type == ProgressItem::Exam && p.item_id == exam_id
            })
            .cloned())
    }

    async fn complete_lesson(
        &self,
        student_id: i64,
        course_id: i64,
        lesson_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Progress, AppError> {
        let mut t = self.tables()?;
        if let Some(existing) = find_progress_mut(&mut t, student_id, ProgressItem::Lesson, lesson_id) {
            if existing.status != ProgressStatus::Completed {
                existing.status = ProgressStatus::Completed;
                existing.completed_at = Some(now);
            }
            return Ok(existing.clone());
        }

        let row = Progress {
            id: t.next_id(),
            student_id,
            course_id,
            item_type: ProgressItem::Lesson,
            item_id: lesson_id,
            status: ProgressStatus::Completed,
            completed_at: Some(now),
            exam_attempts: 0,
            exam_best_score: None,
            exam_latest_score: None,
            exam_passed: false,
            exam_last_attempt_at: None,
        };
        t.progress.insert(row.id, row.clone());
        Ok(row)
    }

    async fn upsert_exam(&self, standing: ExamStanding) -> Result<Progress, AppError> {
        let mut t = self.tables()?;
        let status = if standing.passed {
            ProgressStatus::Completed
        } else {
            ProgressStatus::InProgress
        };

        if let Some(existing) =
            find_progress_mut(&mut t, standing.student_id, ProgressItem::Exam, standing.exam_id)
        {
            existing.status = status;
            existing.exam_attempts = standing.attempts;
            existing.exam_best_score = Some(standing.best_score);
            existing.exam_latest_score = Some(standing.latest_score);
            existing.exam_passed = standing.passed;
            existing.exam_last_attempt_at = Some(standing.last_attempt_at);
            existing.completed_at = if standing.passed {
                existing.completed_at.or(Some(standing.last_attempt_at))
            } else {
                None
            };
            return Ok(existing.clone());
        }

        let row = Progress {
            id: t.next_id(),
            student_id: standing.student_id,
            course_id: standing.course_id,
            item_type: ProgressItem::Exam,
            item_id: standing.exam_id,
            status,
            completed_at: standing.passed.then_some(standing.last_attempt_at),
            exam_attempts: standing.attempts,
            exam_best_score: Some(standing.best_score),
            exam_latest_score: Some(standing.latest_score),
            exam_passed: standing.passed,
            exam_last_attempt_at: Some(standing.last_attempt_at),
        };
        t.progress.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_for_course(&self, student_id: i64, course_id: i64) -> Result<Vec<Progress>, AppError> {
        Ok(self
            .tables()?
            .progress
            .values()
            .filter(|p| p.student_id == student_id && p.course_id == course_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EnrollmentRepository for MemoryStore {
    async fn insert(
        &self,
        student_id: i64,
        course_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, AppError> {
        let mut t = self.tables()?;
        if t
            .enrollments
            .values()
            .any(|e| e.student_id == student_id && e.course_id == course_id)
        {
            return Err(AppError::Conflict(format!(
                "Student {} is already enrolled in course {}",
                student_id, course_id
            )));
        }

        let row = Enrollment {
            id: t.next_id(),
            student_id,
            course_id,
            completed_lesson_ids: Json(Vec::new()),
            completed_exam_ids: Json(Vec::new()),
            total_lessons: 0,
            total_exams: 0,
            progress: 0,
            status: EnrollmentStatus::Active,
            completed_at: None,
            completion_snapshot: None,
            certificate_issued: false,
            version: 0,
            enrolled_at: now,
        };
        t.enrollments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find(&self, id: i64) -> Result<Option<Enrollment>, AppError> {
        Ok(self.tables()?.enrollments.get(&id).cloned())
    }

    async fn find_by_student_course(
        &self,
        student_id: i64,
        course_id: i64,
    ) -> Result<Option<Enrollment>, AppError> {
        Ok(self
            .tables()?
            .enrollments
            .values()
            .find(|e| e.student_id == student_id && e.course_id == course_id)
            .cloned())
    }

    async fn save_if_version(&self, enrollment: &Enrollment) -> Result<Option<Enrollment>, AppError> {
        let mut t = self.tables()?;
        match t.enrollments.get_mut(&enrollment.id) {
            Some(stored) if stored.version == enrollment.version => {
                // Columns owned by other writers are never overwritten.
                let certificate_issued = stored.certificate_issued;
                let snapshot = stored.completion_snapshot.clone();
                *stored = enrollment.clone();
                stored.version += 1;
                stored.certificate_issued = certificate_issued;
                if snapshot.is_some() {
                    stored.completion_snapshot = snapshot;
                }
                Ok(Some(stored.clone()))
            }
            Some(_) => Ok(None),
            None => Err(AppError::NotFound("Enrollment not found".to_string())),
        }
    }
}

#[async_trait]
impl CourseRepository for MemoryStore {
    async fn find_course(&self, id: i64) -> Result<Option<Course>, AppError> {
        Ok(self.tables()?.courses.get(&id).cloned())
    }

    async fn sections(&self, course_id: i64) -> Result<Vec<Section>, AppError> {
        let mut sections: Vec<Section> = self
            .tables()?
            .sections
            .values()
            .filter(|s| s.course_id == course_id)
            .cloned()
            .collect();
        sections.sort_by_key(|s| (s.order, s.id));
        Ok(sections)
    }

    async fn find_section(&self, id: i64) -> Result<Option<Section>, AppError> {
        Ok(self.tables()?.sections.get(&id).cloned())
    }

    async fn lessons(&self, course_id: i64) -> Result<Vec<Lesson>, AppError> {
        let mut lessons: Vec<Lesson> = self
            .tables()?
            .lessons
            .values()
            .filter(|l| l.course_id == course_id)
            .cloned()
            .collect();
        lessons.sort_by_key(|l| (l.order, l.id));
        Ok(lessons)
    }

    async fn find_lesson(&self, id: i64) -> Result<Option<Lesson>, AppError> {
        Ok(self.tables()?.lessons.get(&id).cloned())
    }
}

#[async_trait]
impl CertificateRepository for MemoryStore {
    async fn issue_once(&self, certificate: NewCertificate) -> Result<Option<Certificate>, AppError> {
        let mut t = self.tables()?;
        let enrollment = t
            .enrollments
            .get_mut(&certificate.enrollment_id)
            .ok_or_else(|| AppError::NotFound("Enrollment not found".to_string()))?;
        if enrollment.certificate_issued {
            return Ok(None);
        }
        enrollment.certificate_issued = true;
        enrollment.version += 1;

        let row = Certificate {
            id: t.next_id(),
            enrollment_id: certificate.enrollment_id,
            student_id: certificate.student_id,
            course_id: certificate.course_id,
            code: certificate.code,
            snapshot: Json(certificate.snapshot),
            status: CertificateStatus::Pending,
            asset_html: None,
            generation_attempts: 0,
            last_error: None,
            issued_at: certificate.issued_at,
            generated_at: None,
        };
        t.certificates.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn find(&self, id: i64) -> Result<Option<Certificate>, AppError> {
        Ok(self.tables()?.certificates.get(&id).cloned())
    }

    async fn find_by_enrollment(&self, enrollment_id: i64) -> Result<Option<Certificate>, AppError> {
        Ok(self
            .tables()?
            .certificates
            .values()
            .find(|c| c.enrollment_id == enrollment_id)
            .cloned())
    }

    async fn mark_generated(
        &self,
        id: i64,
        asset_html: String,
        now: DateTime<Utc>,
    ) -> Result<Certificate, AppError> {
        let mut t = self.tables()?;
        let cert = t
            .certificates
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("Certificate not found".to_string()))?;
        cert.status = CertificateStatus::Generated;
        cert.asset_html = Some(asset_html);
        cert.generation_attempts += 1;
        cert.last_error = None;
        cert.generated_at = Some(now);
        Ok(cert.clone())
    }

    async fn mark_failed(&self, id: i64, error: String) -> Result<Certificate, AppError> {
        let mut t = self.tables()?;
        let cert = t
            .certificates
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("Certificate not found".to_string()))?;
        cert.status = CertificateStatus::Failed;
        cert.generation_attempts += 1;
        cert.last_error = Some(error);
        Ok(cert.clone())
    }
}
