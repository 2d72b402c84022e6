// src/services/unlock.rs

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    models::{
        course::Section,
        exam::ExamDefinition,
        progress::ProgressItem,
    },
    repository::{CourseRepository, EnrollmentRepository, ExamRepository, ProgressRepository, Repositories},
    services::require_access,
};

/// What the caller wants to open. Both empty means "the whole course".
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UnlockTarget {
    pub section_id: Option<i64>,
    pub lesson_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingExam {
    pub exam_id: i64,
    pub title: String,
    pub section_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockDecision {
    pub unlocked: bool,
    pub blocking_exam: Option<BlockingExam>,
    pub reason: Option<String>,
}

impl UnlockDecision {
    fn open() -> Self {
        Self {
            unlocked: true,
            blocking_exam: None,
            reason: None,
        }
    }
}

/// Walks sections in ascending order up to and including `target_order`
/// (all of them when `None`). The first published exam in a scanned section
/// without a passed record blocks. Within a section exams are taken by id.
/// Exams not attached to an existing section never gate content.
pub fn evaluate(
    sections: &[Section],
    exams: &[ExamDefinition],
    passed_exam_ids: &HashSet<i64>,
    target_order: Option<i32>,
) -> UnlockDecision {
    let mut ordered: Vec<&Section> = sections.iter().collect();
    ordered.sort_by_key(|s| (s.order, s.id));

    let mut candidates: Vec<&ExamDefinition> = exams.iter().filter(|e| e.is_published()).collect();
    candidates.sort_by_key(|e| e.id);

    for section in ordered
        .into_iter()
        .filter(|s| target_order.is_none_or(|order| s.order <= order))
    {
        let blocking = candidates
            .iter()
            .find(|e| e.section_id == Some(section.id) && !passed_exam_ids.contains(&e.id));

        if let Some(exam) = blocking {
            return UnlockDecision {
                unlocked: false,
                blocking_exam: Some(BlockingExam {
                    exam_id: exam.id,
                    title: exam.title.clone(),
                    section_id: exam.section_id,
                }),
                reason: Some(format!(
                    "Pass the exam \"{}\" in section \"{}\" to unlock this content",
                    exam.title, section.title
                )),
            };
        }
    }

    UnlockDecision::open()
}

pub struct UnlockGate {
    courses: Arc<dyn CourseRepository>,
    exams: Arc<dyn ExamRepository>,
    progress: Arc<dyn ProgressRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
}

impl UnlockGate {
    pub fn new(repos: &Repositories) -> Self {
        Self {
            courses: repos.courses.clone(),
            exams: repos.exams.clone(),
            progress: repos.progress.clone(),
            enrollments: repos.enrollments.clone(),
        }
    }

    /// CheckUnlock: resolves the target to a section order and evaluates.
    pub async fn check(
        &self,
        course_id: i64,
        student_id: i64,
        target: UnlockTarget,
    ) -> Result<UnlockDecision, AppError> {
        self.courses
            .find_course(course_id)
            .await?
            .ok_or(AppError::NotFound("Course not found".to_string()))?;
        require_access(self.enrollments.as_ref(), course_id, student_id).await?;

        let section_id = match (target.lesson_id, target.section_id) {
            (Some(lesson_id), requested_section) => {
                let lesson = self
                    .courses
                    .find_lesson(lesson_id)
                    .await?
                    .filter(|l| l.course_id == course_id)
                    .ok_or(AppError::NotFound("Lesson not found".to_string()))?;
                if requested_section.is_some_and(|s| s != lesson.section_id) {
                    return Err(AppError::BadRequest(
                        "Lesson does not belong to the given section".to_string(),
                    ));
                }
                Some(lesson.section_id)
            }
            (None, section) => section,
        };

        let target_order = match section_id {
            Some(id) => {
                let section = self
                    .courses
                    .find_section(id)
                    .await?
                    .filter(|s| s.course_id == course_id)
                    .ok_or(AppError::NotFound("Section not found".to_string()))?;
                Some(section.order)
            }
            None => None,
        };

        self.decide(course_id, student_id, target_order).await
    }

    /// Evaluation without access checks, for callers that already did them.
    pub async fn decide(
        &self,
        course_id: i64,
        student_id: i64,
        target_order: Option<i32>,
    ) -> Result<UnlockDecision, AppError> {
        let sections = self.courses.sections(course_id).await?;
        let exams = self.exams.list_by_course(course_id).await?;
        let passed: HashSet<i64> = self
            .progress
            .list_for_course(student_id, course_id)
            .await?
            .into_iter()
            .filter(|p| p.item_type == ProgressItem::Exam && p.exam_passed)
            .map(|p| p.item_id)
            .collect();

        let decision = evaluate(&sections, &exams, &passed, target_order);
        if let Some(blocking) = &decision.blocking_exam {
            tracing::debug!(course_id, student_id, exam_id = blocking.exam_id, "Content locked");
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exam::{ExamStatus, ScoringMethod, ShowCorrectAnswers};
    use sqlx::types::Json;

    fn section(id: i64, order: i32) -> Section {
        Section {
            id,
            course_id: 1,
            title: format!("Section {}", order),
            order,
        }
    }

    fn exam(id: i64, section_id: Option<i64>, status: ExamStatus) -> ExamDefinition {
        ExamDefinition {
            id,
            course_id: 1,
            section_id,
            title: format!("Exam {}", id),
            question_refs: Json(vec![]),
            total_points: 10.0,
            passing_score: 5.0,
            duration_minutes: 10,
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
            status,
            created_at: None,
        }
    }

    #[test]
    fn earlier_section_exam_blocks_later_lesson() {
        let sections = [section(10, 1), section(20, 2)];
        let exams = [exam(5, Some(10), ExamStatus::Published)];

        let decision = evaluate(&sections, &exams, &HashSet::new(), Some(2));
        assert!(!decision.unlocked);
        assert_eq!(decision.blocking_exam.unwrap().exam_id, 5);
    }

    #[test]
    fn passed_and_draft_exams_do_not_block() {
        let sections = [section(10, 1), section(20, 2)];
        let exams = [
            exam(5, Some(10), ExamStatus::Published),
            exam(6, Some(20), ExamStatus::Draft),
        ];
        let passed = HashSet::from([5]);

        assert!(evaluate(&sections, &exams, &passed, Some(2)).unlocked);
    }

    #[test]
    fn later_sections_are_not_scanned() {
        let sections = [section(10, 1), section(20, 2)];
        let exams = [exam(6, Some(20), ExamStatus::Published)];

        assert!(evaluate(&sections, &exams, &HashSet::new(), Some(1)).unlocked);
        // The target's own section is scanned.
        assert!(!evaluate(&sections, &exams, &HashSet::new(), Some(2)).unlocked);
    }

    #[test]
    fn whole_course_scan_ignores_orphans_and_course_level_exams() {
        let sections = [section(10, 1)];
        let exams = [
            exam(7, Some(99), ExamStatus::Published),
            exam(8, None, ExamStatus::Published),
        ];
        assert!(evaluate(&sections, &exams, &HashSet::new(), None).unlocked);
    }

    #[test]
    fn first_blocker_by_section_order_then_id() {
        let sections = [section(20, 2), section(10, 1)];
        let exams = [
            exam(9, Some(20), ExamStatus::Published),
            exam(4, Some(10), ExamStatus::Published),
            exam(3, Some(10), ExamStatus::Published),
        ];
        let decision = evaluate(&sections, &exams, &HashSet::new(), None);
        assert_eq!(decision.blocking_exam.unwrap().exam_id, 3);
    }
}
