// tests/common/mod.rs
//
// Shared fixture: an in-memory store with one course (two sections, one
// published lesson each), services wired without the background worker so
// tests apply progress events explicitly.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use coursework::{
    models::{
        course::{Course, Lesson, LessonStatus, Section},
        enrollment::{CreateEnrollmentRequest, Enrollment},
        exam::{CreateExamRequest, ExamDefinition, QuestionRef, ScoringMethod, ShowCorrectAnswers},
        question::{CreateQuestionRequest, Question, QuestionOption, QuestionType},
    },
    repository::{Repositories, memory::MemoryStore},
    services::{certificate::{CertificateRenderer, HtmlCertificateRenderer}, progress::ProgressEvent},
    state::Services,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub services: Services,
    pub events: UnboundedReceiver<ProgressEvent>,
    pub course: Course,
    pub section1: Section,
    pub section2: Section,
    pub lesson1: Lesson,
    pub lesson2: Lesson,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_renderer(Arc::new(HtmlCertificateRenderer))
    }

    pub fn with_renderer(renderer: Arc<dyn CertificateRenderer>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let repos = Repositories::in_memory(store.clone());
        let (services, events) = Services::assemble(&repos, 5, renderer);

        let course = store.add_course("Rust in Practice").unwrap();
        let section1 = store.add_section(course.id, "Basics", 1).unwrap();
        let section2 = store.add_section(course.id, "Ownership", 2).unwrap();
        let lesson1 = store
            .add_lesson(&section1, "Hello", 1, LessonStatus::Published)
            .unwrap();
        let lesson2 = store
            .add_lesson(&section2, "Borrowing", 1, LessonStatus::Published)
            .unwrap();

        Self {
            store,
            services,
            events,
            course,
            section1,
            section2,
            lesson1,
            lesson2,
        }
    }

    pub async fn enroll(&self, student_id: i64) -> Enrollment {
        self.services
            .enrollments
            .create(
                CreateEnrollmentRequest {
                    student_id,
                    course_id: self.course.id,
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }

    /// Single choice question whose correct option is "a".
    pub async fn question(&self, points: f64) -> Question {
        self.services
            .catalog
            .create_question(CreateQuestionRequest {
                question_type: QuestionType::SingleChoice,
                content: format!("Worth {}", points),
                options: vec![
                    QuestionOption {
                        id: "a".to_string(),
                        text: "Right".to_string(),
                        is_correct: true,
                    },
                    QuestionOption {
                        id: "b".to_string(),
                        text: "Wrong".to_string(),
                        is_correct: false,
                    },
                ],
                expected_answers: vec![],
                points,
                negative_marking: false,
                negative_points: 0.0,
                explanation: None,
            })
            .await
            .unwrap()
    }

    pub fn exam_request(&self, questions: &[Question], passing_score: f64) -> CreateExamRequest {
        CreateExamRequest {
            course_id: self.course.id,
            section_id: None,
            title: "Checkpoint".to_string(),
            question_refs: questions
                .iter()
                .enumerate()
                .map(|(i, q)| QuestionRef {
                    question_id: q.id,
                    order: i as i32 + 1,
                    weight: 1.0,
                    point_override: None,
                })
                .collect(),
            passing_score,
            duration_minutes: 30,
            max_attempts: None,
            scoring_method: ScoringMethod::Highest,
            shuffle_questions: false,
            shuffle_answers: false,
            open_at: None,
            close_at: None,
            allow_late_submission: false,
            late_penalty_percent: 0.0,
            show_correct_answers: ShowCorrectAnswers::AfterSubmit,
            show_score_to_student: true,
        }
    }

    /// Creates and publishes an exam.
    pub async fn publish(&self, req: CreateExamRequest) -> ExamDefinition {
        let exam = self.services.catalog.create_exam(req).await.unwrap();
        self.services.catalog.publish_exam(exam.id).await.unwrap()
    }

    /// Applies every queued progress event, like the background worker would.
    pub async fn drain(&mut self, now: DateTime<Utc>) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.services.progress.handle(&event, now).await.unwrap();
            applied += 1;
        }
        applied
    }
}
