// src/services/catalog.rs
//
// Question bank and exam definition authoring. Questions are append-only
// versions; exams are frozen once published.

use std::{collections::HashSet, sync::Arc};

use validator::Validate;

use crate::{
    error::AppError,
    models::{
        exam::{CreateExamRequest, ExamDefinition, ExamStatus, NewExam},
        question::{CreateQuestionRequest, Question},
    },
    repository::{CourseRepository, ExamRepository, QuestionRepository, Repositories},
    services::grading::max_score_for,
};

pub struct CatalogService {
    questions: Arc<dyn QuestionRepository>,
    exams: Arc<dyn ExamRepository>,
    courses: Arc<dyn CourseRepository>,
}

impl CatalogService {
    pub fn new(repos: &Repositories) -> Self {
        Self {
            questions: repos.questions.clone(),
            exams: repos.exams.clone(),
            courses: repos.courses.clone(),
        }
    }

    pub async fn create_question(&self, req: CreateQuestionRequest) -> Result<Question, AppError> {
        let new_question = req.into_new_question(1, None)?;
        let question = self.questions.insert(new_question).await?;
        tracing::info!(question_id = question.id, "Question created");
        Ok(question)
    }

    /// Inserts version n+1 pointing back at `question_id` and archives the
    /// revised version. Only the latest version can be revised.
    pub async fn revise_question(
        &self,
        question_id: i64,
        req: CreateQuestionRequest,
    ) -> Result<Question, AppError> {
        let current = self.get_question(question_id).await?;
        let new_question = req.into_new_question(current.version + 1, Some(current.id))?;

        if !self.questions.archive(current.id).await? {
            return Err(AppError::Conflict(
                "Only the latest version of a question can be revised".to_string(),
            ));
        }

        let revision = self.questions.insert(new_question).await?;
        tracing::info!(
            question_id = revision.id,
            parent_id = current.id,
            version = revision.version,
            "Question revised"
        );
        Ok(revision)
    }

    pub async fn get_question(&self, question_id: i64) -> Result<Question, AppError> {
        self.questions
            .find(question_id)
            .await?
            .ok_or(AppError::NotFound("Question not found".to_string()))
    }

    /// Creates a draft exam after checking references and derived totals.
    pub async fn create_exam(&self, req: CreateExamRequest) -> Result<ExamDefinition, AppError> {
        req.validate()?;

        self.courses
            .find_course(req.course_id)
            .await?
            .ok_or(AppError::NotFound("Course not found".to_string()))?;

        if let Some(section_id) = req.section_id {
            let section = self.courses.find_section(section_id).await?;
            if section.is_none_or(|s| s.course_id != req.course_id) {
                return Err(AppError::BadRequest(
                    "Section does not belong to the course".to_string(),
                ));
            }
        }

        if let (Some(open), Some(close)) = (req.open_at, req.close_at) {
            if open >= close {
                return Err(AppError::BadRequest(
                    "open_at must be before close_at".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for question_ref in &req.question_refs {
            if !seen.insert(question_ref.question_id) {
                return Err(AppError::BadRequest(format!(
                    "Question {} is referenced twice",
                    question_ref.question_id
                )));
            }
            if question_ref.weight <= 0.0 {
                return Err(AppError::BadRequest("Weight must be positive".to_string()));
            }
            if question_ref.point_override.is_some_and(|p| p <= 0.0) {
                return Err(AppError::BadRequest(
                    "Point override must be positive".to_string(),
                ));
            }
        }

        let ids: Vec<i64> = req.question_refs.iter().map(|r| r.question_id).collect();
        let questions = self.questions.find_many(&ids).await?;

        let mut total_points = 0.0;
        for question_ref in &req.question_refs {
            let question = questions
                .iter()
                .find(|q| q.id == question_ref.question_id)
                .ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "Question {} does not exist",
                        question_ref.question_id
                    ))
                })?;
            if question.is_archived {
                return Err(AppError::BadRequest(format!(
                    "Question {} is archived; reference its latest version",
                    question.id
                )));
            }
            total_points += max_score_for(question, question_ref);
        }

        if req.passing_score > total_points {
            return Err(AppError::PolicyViolation(format!(
                "Passing score ({}) exceeds total points ({})",
                req.passing_score, total_points
            )));
        }

        let exam = self
            .exams
            .insert(NewExam {
                course_id: req.course_id,
                section_id: req.section_id,
                title: req.title,
                question_refs: req.question_refs,
                total_points,
                passing_score: req.passing_score,
                duration_minutes: req.duration_minutes,
                max_attempts: req.max_attempts,
                scoring_method: req.scoring_method,
                shuffle_questions: req.shuffle_questions,
                shuffle_answers: req.shuffle_answers,
                open_at: req.open_at,
                close_at: req.close_at,
                allow_late_submission: req.allow_late_submission,
                late_penalty_percent: req.late_penalty_percent,
                show_correct_answers: req.show_correct_answers,
                show_score_to_student: req.show_score_to_student,
            })
            .await?;

        tracing::info!(exam_id = exam.id, course_id = exam.course_id, total_points, "Exam created");
        Ok(exam)
    }

    pub async fn publish_exam(&self, exam_id: i64) -> Result<ExamDefinition, AppError> {
        self.transition(exam_id, ExamStatus::Draft, ExamStatus::Published)
            .await
    }

    pub async fn archive_exam(&self, exam_id: i64) -> Result<ExamDefinition, AppError> {
        self.transition(exam_id, ExamStatus::Published, ExamStatus::Archived)
            .await
    }

    async fn transition(
        &self,
        exam_id: i64,
        from: ExamStatus,
        to: ExamStatus,
    ) -> Result<ExamDefinition, AppError> {
        if let Some(exam) = self.exams.transition_status(exam_id, from, to).await? {
            tracing::info!(exam_id, status = ?to, "Exam status changed");
            return Ok(exam);
        }

        let exam = self
            .exams
            .find(exam_id)
            .await?
            .ok_or(AppError::NotFound("Exam not found".to_string()))?;

        Err(AppError::Conflict(format!(
            "Exam is {:?}, expected {:?}",
            exam.status, from
        )))
    }
}
