// src/services/progress.rs
//
// Progress aggregation driven by explicit events. Lesson completions and exam
// submissions are queued on a channel and applied by a single worker, so the
// requests that produce them never wait on (or fail because of) a recompute.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{
    error::AppError,
    models::{
        attempt::AttemptStatus,
        enrollment::{CourseTally, Enrollment, EnrollmentEffect},
        exam::ScoringMethod,
        progress::{ExamStanding, Progress, ProgressItem, ProgressStatus},
    },
    repository::{
        AttemptRepository, CourseRepository, EnrollmentRepository, ExamRepository,
        ProgressRepository, Repositories,
    },
    services::certificate::CertificateService,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    LessonCompleted {
        student_id: i64,
        course_id: i64,
        lesson_id: i64,
    },
    /// Published for every submitted attempt, passed or not.
    ExamSubmitted {
        student_id: i64,
        course_id: i64,
        exam_id: i64,
        attempt_id: i64,
    },
}

impl ProgressEvent {
    pub fn student_id(&self) -> i64 {
        match self {
            ProgressEvent::LessonCompleted { student_id, .. }
            | ProgressEvent::ExamSubmitted { student_id, .. } => *student_id,
        }
    }

    pub fn course_id(&self) -> i64 {
        match self {
            ProgressEvent::LessonCompleted { course_id, .. }
            | ProgressEvent::ExamSubmitted { course_id, .. } => *course_id,
        }
    }
}

/// Folds submitted scores (oldest first) into the exam's standing score.
pub fn standing_score(method: ScoringMethod, scores: &[f64]) -> Option<f64> {
    match method {
        ScoringMethod::Highest => scores.iter().copied().reduce(f64::max),
        ScoringMethod::Latest => scores.last().copied(),
        ScoringMethod::Average => {
            if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            }
        }
    }
}

/// Sending half of the progress pipeline. Cheap to clone.
#[derive(Clone)]
pub struct ProgressPipeline {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressPipeline {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues an event. Never fails the caller; a closed pipeline is logged.
    pub fn publish(&self, event: ProgressEvent) {
        if let Err(e) = self.sender.send(event) {
            tracing::error!(event = ?e.0, "Progress pipeline is closed, event dropped");
        }
    }
}

/// Applies queued events until every sender is gone.
pub async fn run_worker(
    aggregator: Arc<ProgressAggregator>,
    mut receiver: mpsc::UnboundedReceiver<ProgressEvent>,
) {
    tracing::info!("Progress pipeline started");
    while let Some(event) = receiver.recv().await {
        if let Err(e) = aggregator.handle(&event, Utc::now()).await {
            tracing::error!(
                student_id = event.student_id(),
                course_id = event.course_id(),
                "Progress update failed: {}",
                e
            );
        }
    }
    tracing::info!("Progress pipeline stopped");
}

pub struct ProgressAggregator {
    exams: Arc<dyn ExamRepository>,
    attempts: Arc<dyn AttemptRepository>,
    progress: Arc<dyn ProgressRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
    courses: Arc<dyn CourseRepository>,
    certificates: CertificateService,
    max_retries: u32,
}

impl ProgressAggregator {
    pub fn new(repos: &Repositories, certificates: CertificateService, max_retries: u32) -> Self {
        Self {
            exams: repos.exams.clone(),
            attempts: repos.attempts.clone(),
            progress: repos.progress.clone(),
            enrollments: repos.enrollments.clone(),
            courses: repos.courses.clone(),
            certificates,
            max_retries,
        }
    }

    /// Applies one event. Returns the enrollment as stored afterwards, or
    /// `None` when the student has no enrollment in the course.
    pub async fn handle(
        &self,
        event: &ProgressEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, AppError> {
        if let ProgressEvent::ExamSubmitted {
            student_id,
            exam_id,
            attempt_id,
            ..
        } = event
        {
            tracing::debug!(attempt_id, exam_id, student_id, "Refreshing exam standing");
            self.refresh_exam_standing(*student_id, *exam_id).await?;
        }

        let Some(enrollment) = self
            .enrollments
            .find_by_student_course(event.student_id(), event.course_id())
            .await?
        else {
            tracing::warn!(
                student_id = event.student_id(),
                course_id = event.course_id(),
                "Progress event for a student without enrollment"
            );
            return Ok(None);
        };

        self.recompute_enrollment(enrollment, now).await.map(Some)
    }

    /// Rebuilds the exam progress record from every submitted attempt.
    pub async fn refresh_exam_standing(
        &self,
        student_id: i64,
        exam_id: i64,
    ) -> Result<Option<Progress>, AppError> {
        let exam = self
            .exams
            .find(exam_id)
            .await?
            .ok_or(AppError::NotFound("Exam not found".to_string()))?;

        let mut submitted: Vec<_> = self
            .attempts
            .list_for_student(exam_id, student_id)
            .await?
            .into_iter()
            .filter(|a| a.status == AttemptStatus::Submitted)
            .filter_map(|a| Some((a.submitted_at?, a.id, a.score?)))
            .collect();
        submitted.sort_by_key(|(at, id, _)| (*at, *id));

        let scores: Vec<f64> = submitted.iter().map(|(_, _, score)| *score).collect();
        let (Some(best), Some((last_at, _, latest))) =
            (standing_score(exam.scoring_method, &scores), submitted.last())
        else {
            return Ok(None);
        };

        let standing = ExamStanding {
            student_id,
            course_id: exam.course_id,
            exam_id,
            attempts: scores.len() as i32,
            best_score: best,
            latest_score: *latest,
            passed: best >= exam.passing_score,
            last_attempt_at: *last_at,
        };

        let record = self.progress.upsert_exam(standing).await?;
        tracing::info!(
            student_id,
            exam_id,
            best_score = best,
            passed = record.exam_passed,
            "Exam standing updated"
        );
        Ok(Some(record))
    }

    /// RecomputeProgress: fresh recompute of one enrollment.
    pub async fn recompute(&self, enrollment_id: i64, now: DateTime<Utc>) -> Result<Enrollment, AppError> {
        let enrollment = self
            .enrollments
            .find(enrollment_id)
            .await?
            .ok_or(AppError::NotFound("Enrollment not found".to_string()))?;

        self.recompute_enrollment(enrollment, now).await
    }

    async fn tally(&self, student_id: i64, course_id: i64) -> Result<CourseTally, AppError> {
        let published_lesson_ids = self
            .courses
            .lessons(course_id)
            .await?
            .into_iter()
            .filter(|l| l.is_published())
            .map(|l| l.id)
            .collect();

        let required_exam_ids = self
            .exams
            .list_by_course(course_id)
            .await?
            .into_iter()
            .filter(|e| e.is_published())
            .map(|e| e.id)
            .collect();

        let records = self.progress.list_for_course(student_id, course_id).await?;
        let completed_lesson_ids = records
            .iter()
            .filter(|p| p.item_type == ProgressItem::Lesson && p.status == ProgressStatus::Completed)
            .map(|p| p.item_id)
            .collect();
        let passed_exam_ids = records
            .iter()
            .filter(|p| p.item_type == ProgressItem::Exam && p.exam_passed)
            .map(|p| p.item_id)
            .collect();

        Ok(CourseTally {
            published_lesson_ids,
            required_exam_ids,
            completed_lesson_ids,
            passed_exam_ids,
        })
    }

    /// Read-modify-write with a version check, retried on conflict. Every
    /// round starts from a fresh read of the enrollment and its tally.
    async fn recompute_enrollment(
        &self,
        mut enrollment: Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, AppError> {
        for round in 0..=self.max_retries {
            let tally = self.tally(enrollment.student_id, enrollment.course_id).await?;
            let outcome = enrollment.recompute(&tally, now);

            let Some(saved) = self.enrollments.save_if_version(&outcome.enrollment).await? else {
                tracing::debug!(
                    enrollment_id = enrollment.id,
                    round,
                    "Enrollment changed underneath recompute, retrying"
                );
                enrollment = self
                    .enrollments
                    .find(enrollment.id)
                    .await?
                    .ok_or(AppError::NotFound("Enrollment not found".to_string()))?;
                continue;
            };

            if outcome.newly_completed {
                tracing::info!(
                    enrollment_id = saved.id,
                    student_id = saved.student_id,
                    course_id = saved.course_id,
                    "Enrollment completed"
                );
            }

            return self.apply_effects(saved, &outcome.effects, now).await;
        }

        Err(AppError::Conflict(format!(
            "Enrollment {} kept changing during recompute",
            enrollment.id
        )))
    }

    async fn apply_effects(
        &self,
        enrollment: Enrollment,
        effects: &[EnrollmentEffect],
        now: DateTime<Utc>,
    ) -> Result<Enrollment, AppError> {
        let mut current = enrollment;
        for effect in effects {
            match effect {
                EnrollmentEffect::IssueCertificate => {
                    // Best effort; RetryCertificate picks up failures.
                    match self.certificates.issue(&current, now).await {
                        Ok(_) => {
                            if let Some(fresh) = self.enrollments.find(current.id).await? {
                                current = fresh;
                            }
                        }
                        Err(e) => tracing::error!(
                            enrollment_id = current.id,
                            "Certificate issuance failed: {}",
                            e
                        ),
                    }
                }
            }
        }
        Ok(current)
    }
}
