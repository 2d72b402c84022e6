// src/services/attempt.rs
//
// Attempt lifecycle: in_progress -> submitted | expired. Every transition is a
// conditional write in storage; the checks here only decide which one to try.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{
    error::AppError,
    models::{
        attempt::{
            AttemptQuestion, AttemptQuestionView, AttemptStatus, AttemptView, ExamAttempt,
            GradedSubmission, GradedSummary, NewAttempt, SubmitAttemptRequest,
        },
        exam::{AttemptSummary, ExamDefinition, ExamOverview, ExamStatus},
        question::{PublicOption, Question},
    },
    repository::{AttemptRepository, EnrollmentRepository, ExamRepository, QuestionRepository, Repositories},
    services::{
        Viewer,
        grading::{self, max_score_for},
        progress::{ProgressEvent, ProgressPipeline, standing_score},
        require_access,
    },
};

/// Result of StartAttempt.
#[derive(Debug, Clone)]
pub struct StartedAttempt {
    pub attempt: AttemptView,
    /// False when an existing in-progress attempt was returned.
    pub created: bool,
}

/// Published and inside the window (late starts allowed only when late
/// submission is).
pub fn check_start_window(exam: &ExamDefinition, now: DateTime<Utc>) -> Result<(), AppError> {
    if exam.status != ExamStatus::Published {
        return Err(AppError::PolicyViolation("Exam is not published".to_string()));
    }
    if !exam.has_opened(now) {
        return Err(AppError::PolicyViolation("Exam is not open yet".to_string()));
    }
    if exam.is_past_close(now) && !exam.allow_late_submission {
        return Err(AppError::PolicyViolation("Exam is closed".to_string()));
    }
    Ok(())
}

/// Only submitted attempts count toward `max_attempts`.
pub fn check_attempt_limit(exam: &ExamDefinition, submitted: usize) -> Result<(), AppError> {
    match exam.max_attempts {
        Some(max) if submitted as i64 >= max as i64 => Err(AppError::PolicyViolation(format!(
            "Maximum attempts ({}) reached",
            max
        ))),
        _ => Ok(()),
    }
}

/// Builds the attempt's question set. Question order and each question's
/// option order are shuffled independently when the exam asks for it.
/// The max score covers every referenced question.
pub fn materialize(
    exam: &ExamDefinition,
    questions: &HashMap<i64, Question>,
    rng: &mut StdRng,
) -> Result<(Vec<AttemptQuestion>, f64), AppError> {
    let mut refs = exam.ordered_refs();
    if exam.shuffle_questions {
        refs.shuffle(rng);
    }

    let mut set = Vec::with_capacity(refs.len());
    let mut total = 0.0;
    for question_ref in &refs {
        let question = questions.get(&question_ref.question_id).ok_or_else(|| {
            AppError::InternalServerError(format!(
                "Question {} referenced by exam {} is missing",
                question_ref.question_id, exam.id
            ))
        })?;

        let mut option_order = question.option_ids();
        if exam.shuffle_answers {
            option_order.shuffle(rng);
        }

        let max_score = max_score_for(question, question_ref);
        total += max_score;
        set.push(AttemptQuestion {
            question_id: question.id,
            option_order,
            max_score,
        });
    }

    Ok((set, total))
}

/// Applies score visibility and answer reveal policies to an attempt.
pub fn attempt_view(
    attempt: &ExamAttempt,
    exam: &ExamDefinition,
    questions: &HashMap<i64, Question>,
    viewer: Viewer,
    now: DateTime<Utc>,
) -> AttemptView {
    let finished = !attempt.is_in_progress();
    let show_score = viewer.is_admin || (finished && exam.show_score_to_student);
    let reveal = viewer.is_admin || (finished && exam.reveals_correct_answers(now));

    let graded: HashMap<i64, _> = attempt.answers.iter().map(|a| (a.question_id, a)).collect();

    let views = attempt
        .questions
        .iter()
        .filter_map(|item| {
            let question = questions.get(&item.question_id)?;
            let options = item
                .option_order
                .iter()
                .filter_map(|id| question.options.iter().find(|o| &o.id == id))
                .map(|o| PublicOption {
                    id: o.id.clone(),
                    text: o.text.clone(),
                })
                .collect();
            let answer = graded.get(&item.question_id);

            Some(AttemptQuestionView {
                question_id: question.id,
                question_type: question.question_type,
                content: question.content.clone(),
                options,
                max_score: item.max_score,
                submitted: answer.and_then(|a| a.submitted.clone()),
                is_correct: answer.filter(|_| reveal).map(|a| a.is_correct),
                score: answer.filter(|_| show_score).map(|a| a.score),
                correct_option_ids: reveal
                    .then(|| question.correct_option_ids())
                    .filter(|ids| !ids.is_empty()),
                expected_answers: reveal
                    .then(|| {
                        question
                            .expected_answers
                            .iter()
                            .map(|a| a.text.clone())
                            .collect::<Vec<_>>()
                    })
                    .filter(|answers| !answers.is_empty()),
                explanation: question.explanation.clone().filter(|_| reveal),
            })
        })
        .collect();

    AttemptView {
        id: attempt.id,
        exam_id: attempt.exam_id,
        student_id: attempt.student_id,
        attempt_number: attempt.attempt_number,
        status: attempt.status,
        started_at: attempt.started_at,
        expires_at: attempt.expires_at,
        submitted_at: attempt.submitted_at,
        is_late: attempt.is_late,
        score: attempt.score.filter(|_| show_score),
        max_score: show_score.then_some(attempt.max_score),
        passed: attempt.passed.filter(|_| show_score),
        questions: views,
    }
}

pub struct ExamService {
    exams: Arc<dyn ExamRepository>,
    questions: Arc<dyn QuestionRepository>,
    attempts: Arc<dyn AttemptRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
    pipeline: ProgressPipeline,
}

impl ExamService {
    pub fn new(repos: &Repositories, pipeline: ProgressPipeline) -> Self {
        Self {
            exams: repos.exams.clone(),
            questions: repos.questions.clone(),
            attempts: repos.attempts.clone(),
            enrollments: repos.enrollments.clone(),
            pipeline,
        }
    }

    async fn load_exam(&self, exam_id: i64) -> Result<ExamDefinition, AppError> {
        self.exams
            .find(exam_id)
            .await?
            .ok_or(AppError::NotFound("Exam not found".to_string()))
    }

    async fn load_questions(&self, ids: &[i64]) -> Result<HashMap<i64, Question>, AppError> {
        let rows = self.questions.find_many(ids).await?;
        Ok(rows.into_iter().map(|q| (q.id, q)).collect())
    }

    /// GetExamOverview
    pub async fn overview(
        &self,
        exam_id: i64,
        student_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ExamOverview, AppError> {
        let exam = self.load_exam(exam_id).await?;
        // Drafts are invisible to students.
        if exam.status == ExamStatus::Draft {
            return Err(AppError::NotFound("Exam not found".to_string()));
        }
        require_access(self.enrollments.as_ref(), exam.course_id, student_id).await?;

        let attempts = self.attempts.list_for_student(exam.id, student_id).await?;
        let submitted: Vec<&ExamAttempt> = attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Submitted)
            .collect();
        let resumable = attempts
            .iter()
            .find(|a| a.is_in_progress() && !a.has_expired_at(now));

        let mut scored: Vec<&ExamAttempt> = submitted.clone();
        scored.sort_by_key(|a| (a.submitted_at, a.id));
        let scores: Vec<f64> = scored.iter().filter_map(|a| a.score).collect();
        let best_score = standing_score(exam.scoring_method, &scores);

        let blocker = check_start_window(&exam, now)
            .and_then(|_| check_attempt_limit(&exam, submitted.len()))
            .err();
        let can_start = resumable.is_some() || blocker.is_none();

        let attempt_summary = AttemptSummary {
            attempts_used: submitted.len() as i64,
            attempts_remaining: exam
                .max_attempts
                .map(|max| (max as i64 - submitted.len() as i64).max(0)),
            in_progress_attempt_id: resumable.map(|a| a.id),
            last_attempt_at: attempts.iter().map(|a| a.started_at).max(),
            best_score: best_score.filter(|_| exam.show_score_to_student),
            passed: best_score
                .filter(|_| exam.show_score_to_student)
                .map(|score| score >= exam.passing_score),
        };

        Ok(ExamOverview {
            id: exam.id,
            course_id: exam.course_id,
            section_id: exam.section_id,
            title: exam.title.clone(),
            question_count: exam.question_refs.len(),
            total_points: exam.total_points,
            passing_score: exam.passing_score,
            duration_minutes: exam.duration_minutes,
            max_attempts: exam.max_attempts,
            scoring_method: exam.scoring_method,
            open_at: exam.open_at,
            close_at: exam.close_at,
            allow_late_submission: exam.allow_late_submission,
            late_penalty_percent: exam.late_penalty_percent,
            show_correct_answers: exam.show_correct_answers,
            attempts: attempt_summary,
            can_start,
            reason: if can_start {
                None
            } else {
                blocker.map(|e| e.message().to_string())
            },
        })
    }

    /// StartAttempt. Idempotent while an attempt is in progress.
    pub async fn start(
        &self,
        exam_id: i64,
        student_id: i64,
        now: DateTime<Utc>,
    ) -> Result<StartedAttempt, AppError> {
        let exam = self.load_exam(exam_id).await?;
        if exam.status != ExamStatus::Published {
            return Err(AppError::PolicyViolation("Exam is not published".to_string()));
        }
        require_access(self.enrollments.as_ref(), exam.course_id, student_id).await?;
        check_start_window(&exam, now)?;

        let viewer = Viewer::student(student_id);

        if let Some(existing) = self.attempts.find_in_progress(exam.id, student_id).await? {
            if !existing.has_expired_at(now) {
                tracing::info!(attempt_id = existing.id, exam_id, student_id, "Attempt resumed");
                return self.started(existing, &exam, viewer, false, now).await;
            }
            // Timed out without a submission.
            if self.attempts.expire(existing.id).await?.is_some() {
                tracing::info!(attempt_id = existing.id, exam_id, student_id, "Attempt expired");
            }
        }

        let history = self.attempts.list_for_student(exam.id, student_id).await?;
        let submitted = history
            .iter()
            .filter(|a| a.status == AttemptStatus::Submitted)
            .count();
        check_attempt_limit(&exam, submitted)?;

        let questions = self.load_questions(&exam.question_ids()).await?;
        let (question_set, max_score) = {
            let mut rng = StdRng::from_entropy();
            materialize(&exam, &questions, &mut rng)?
        };

        let (attempt, created) = self
            .attempts
            .create_or_resume(NewAttempt {
                exam_id: exam.id,
                student_id,
                attempt_number: history.len() as i32 + 1,
                questions: question_set,
                started_at: now,
                expires_at: now + Duration::minutes(exam.duration_minutes as i64),
                max_score,
            })
            .await?;

        if created {
            tracing::info!(
                attempt_id = attempt.id,
                exam_id,
                student_id,
                attempt_number = attempt.attempt_number,
                "Attempt started"
            );
        }

        let view = attempt_view(&attempt, &exam, &questions, viewer, now);
        Ok(StartedAttempt {
            attempt: view,
            created,
        })
    }

    async fn started(
        &self,
        attempt: ExamAttempt,
        exam: &ExamDefinition,
        viewer: Viewer,
        created: bool,
        now: DateTime<Utc>,
    ) -> Result<StartedAttempt, AppError> {
        let ids: Vec<i64> = attempt.questions.iter().map(|q| q.question_id).collect();
        let questions = self.load_questions(&ids).await?;
        Ok(StartedAttempt {
            attempt: attempt_view(&attempt, exam, &questions, viewer, now),
            created,
        })
    }

    /// SubmitAttempt
    pub async fn submit(
        &self,
        attempt_id: i64,
        student_id: i64,
        req: SubmitAttemptRequest,
        now: DateTime<Utc>,
    ) -> Result<GradedSummary, AppError> {
        let attempt = self
            .attempts
            .find(attempt_id)
            .await?
            .ok_or(AppError::NotFound("Attempt not found".to_string()))?;

        if attempt.student_id != student_id {
            return Err(AppError::Forbidden(
                "Attempt belongs to another student".to_string(),
            ));
        }

        match attempt.status {
            AttemptStatus::Submitted => {
                return Err(AppError::Conflict("Attempt already submitted".to_string()));
            }
            AttemptStatus::Expired => {
                return Err(AppError::Conflict("Attempt has expired".to_string()));
            }
            AttemptStatus::InProgress => {}
        }

        if let Some(unknown) = req
            .answers
            .keys()
            .find(|id| !attempt.questions.iter().any(|q| q.question_id == **id))
        {
            return Err(AppError::BadRequest(format!(
                "Question {} is not part of this attempt",
                unknown
            )));
        }

        if attempt.has_expired_at(now) {
            if self.attempts.expire(attempt.id).await?.is_some() {
                tracing::info!(attempt_id, student_id, "Late submission expired the attempt");
            }
            return Err(AppError::Conflict("Attempt has expired".to_string()));
        }

        let exam = self.load_exam(attempt.exam_id).await?;
        let is_late = exam.is_past_close(now);
        if is_late && !exam.allow_late_submission {
            return Err(AppError::PolicyViolation(
                "Exam is closed and late submissions are not allowed".to_string(),
            ));
        }

        let questions = self.load_questions(&exam.question_ids()).await?;
        let frozen_max: HashMap<i64, f64> = attempt
            .questions
            .iter()
            .map(|q| (q.question_id, q.max_score))
            .collect();
        let report =
            grading::grade(&exam.ordered_refs(), &questions, &frozen_max, &req.answers)?;
        if (report.total_max_score - attempt.max_score).abs() > f64::EPSILON {
            tracing::warn!(
                attempt_id,
                frozen = attempt.max_score,
                recomputed = report.total_max_score,
                "Max score differs from the value frozen at start"
            );
        }

        let score = grading::final_score(report.total_score, is_late, exam.late_penalty_percent);
        let passed = score >= exam.passing_score;

        let Some(stored) = self
            .attempts
            .complete(
                attempt.id,
                GradedSubmission {
                    answers: report.answers,
                    score,
                    max_score: attempt.max_score,
                    passed,
                    is_late,
                    submitted_at: now,
                },
            )
            .await?
        else {
            return Err(AppError::Conflict("Attempt already submitted".to_string()));
        };

        tracing::info!(
            attempt_id,
            exam_id = exam.id,
            student_id,
            score,
            passed,
            is_late,
            "Attempt submitted"
        );

        self.pipeline.publish(ProgressEvent::ExamSubmitted {
            student_id,
            course_id: exam.course_id,
            exam_id: exam.id,
            attempt_id: stored.id,
        });

        let show_score = exam.show_score_to_student;
        Ok(GradedSummary {
            attempt_id: stored.id,
            exam_id: stored.exam_id,
            status: stored.status,
            submitted_at: stored.submitted_at,
            is_late: stored.is_late,
            answered_count: report.answered_count,
            question_count: stored.questions.len(),
            score: stored.score.filter(|_| show_score),
            max_score: show_score.then_some(stored.max_score),
            passed: stored.passed.filter(|_| show_score),
            correct_count: show_score.then_some(report.correct_count),
        })
    }

    /// GetAttempt. Students see their own attempts; admins see any in full.
    pub async fn get_attempt(
        &self,
        attempt_id: i64,
        viewer: Viewer,
        now: DateTime<Utc>,
    ) -> Result<AttemptView, AppError> {
        let attempt = self
            .attempts
            .find(attempt_id)
            .await?
            .ok_or(AppError::NotFound("Attempt not found".to_string()))?;

        if !viewer.is_admin && attempt.student_id != viewer.user_id {
            return Err(AppError::Forbidden(
                "Attempt belongs to another student".to_string(),
            ));
        }

        let exam = self.load_exam(attempt.exam_id).await?;
        let ids: Vec<i64> = attempt.questions.iter().map(|q| q.question_id).collect();
        let questions = self.load_questions(&ids).await?;

        Ok(attempt_view(&attempt, &exam, &questions, viewer, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        attempt::{AnswerValue, GradedAnswer},
        exam::{QuestionRef, ScoringMethod, ShowCorrectAnswers},
        question::{QuestionOption, QuestionType},
    };
    use sqlx::types::Json;

    fn question(id: i64) -> Question {
        Question {
            id,
            question_type: QuestionType::SingleChoice,
            content: format!("Q{}", id),
            options: Json(vec![
                QuestionOption { id: "a".into(), text: "A".into(), is_correct: true },
                QuestionOption { id: "b".into(), text: "B".into(), is_correct: false },
                QuestionOption { id: "c".into(), text: "C".into(), is_correct: false },
            ]),
            expected_answers: Json(vec![]),
            points: 2.0,
            negative_marking: false,
            negative_points: 0.0,
            explanation: Some("Because A".into()),
            version: 1,
            parent_id: None,
            is_archived: false,
            created_at: None,
        }
    }

    fn exam(max_attempts: Option<i32>) -> ExamDefinition {
        ExamDefinition {
            id: 1,
            course_id: 1,
            section_id: None,
            title: "Final".into(),
            question_refs: Json(vec![
                QuestionRef { question_id: 1, order: 1, weight: 1.0, point_override: None },
                QuestionRef { question_id: 2, order: 2, weight: 2.0, point_override: None },
            ]),
            total_points: 6.0,
            passing_score: 3.0,
            duration_minutes: 30,
            max_attempts,
            scoring_method: ScoringMethod::Highest,
            shuffle_questions: true,
            shuffle_answers: true,
            open_at: None,
            close_at: None,
            allow_late_submission: false,
            late_penalty_percent: 0.0,
            show_correct_answers: ShowCorrectAnswers::AfterSubmit,
            show_score_to_student: true,
            status: ExamStatus::Published,
            created_at: None,
        }
    }

    fn bank() -> HashMap<i64, Question> {
        [(1, question(1)), (2, question(2))].into_iter().collect()
    }

    fn in_progress(questions: Vec<AttemptQuestion>) -> ExamAttempt {
        let now = Utc::now();
        ExamAttempt {
            id: 5,
            exam_id: 1,
            student_id: 9,
            attempt_number: 1,
            questions: Json(questions),
            started_at: now,
            expires_at: now + Duration::minutes(30),
            submitted_at: None,
            status: AttemptStatus::InProgress,
            answers: Json(vec![]),
            score: None,
            max_score: 6.0,
            passed: None,
            is_late: false,
        }
    }

    #[test]
    fn materialize_covers_every_question() {
        let mut rng = StdRng::seed_from_u64(7);
        let (set, total) = materialize(&exam(None), &bank(), &mut rng).unwrap();

        assert_eq!(total, 6.0);
        assert_eq!(set.len(), 2);
        for item in &set {
            let mut order = item.option_order.clone();
            order.sort();
            assert_eq!(order, vec!["a", "b", "c"]);
        }
    }

    #[test]
    fn attempt_limit_message() {
        let err = check_attempt_limit(&exam(Some(2)), 2).unwrap_err();
        assert_eq!(
            err,
            AppError::PolicyViolation("Maximum attempts (2) reached".to_string())
        );
        assert!(check_attempt_limit(&exam(Some(2)), 1).is_ok());
        assert!(check_attempt_limit(&exam(None), 100).is_ok());
    }

    #[test]
    fn window_checks() {
        let now = Utc::now();
        let mut e = exam(None);
        e.open_at = Some(now + Duration::hours(1));
        assert!(check_start_window(&e, now).is_err());

        e.open_at = None;
        e.close_at = Some(now - Duration::hours(1));
        assert!(check_start_window(&e, now).is_err());

        e.allow_late_submission = true;
        assert!(check_start_window(&e, now).is_ok());

        e.status = ExamStatus::Draft;
        assert_eq!(
            check_start_window(&e, now).unwrap_err(),
            AppError::PolicyViolation("Exam is not published".to_string())
        );
    }

    #[test]
    fn in_progress_view_hides_answer_keys() {
        let mut rng = StdRng::seed_from_u64(1);
        let (set, _) = materialize(&exam(None), &bank(), &mut rng).unwrap();
        let attempt = in_progress(set);

        let view = attempt_view(&attempt, &exam(None), &bank(), Viewer::student(9), Utc::now());
        assert!(view.score.is_none());
        assert!(view.max_score.is_none());
        assert!(view.questions.iter().all(|q| q.correct_option_ids.is_none()));
        assert!(view.questions.iter().all(|q| q.explanation.is_none()));

        let admin = Viewer { user_id: 1, is_admin: true };
        let full = attempt_view(&attempt, &exam(None), &bank(), admin, Utc::now());
        assert!(full.questions.iter().all(|q| q.correct_option_ids.is_some()));
    }

    #[test]
    fn hidden_score_policy_applies_after_submit() {
        let mut attempt = in_progress(vec![AttemptQuestion {
            question_id: 1,
            option_order: vec!["a".into(), "b".into(), "c".into()],
            max_score: 2.0,
        }]);
        attempt.status = AttemptStatus::Submitted;
        attempt.score = Some(2.0);
        attempt.passed = Some(true);
        attempt.answers = Json(vec![GradedAnswer {
            question_id: 1,
            submitted: Some(AnswerValue::Text("a".into())),
            is_correct: true,
            score: 2.0,
            max_score: 2.0,
        }]);

        let mut e = exam(None);
        e.show_score_to_student = false;
        e.show_correct_answers = ShowCorrectAnswers::Never;

        let view = attempt_view(&attempt, &e, &bank(), Viewer::student(9), Utc::now());
        assert!(view.score.is_none());
        assert!(view.passed.is_none());
        assert!(view.questions[0].score.is_none());
        assert!(view.questions[0].is_correct.is_none());
        assert_eq!(view.questions[0].submitted, Some(AnswerValue::Text("a".into())));
    }

    #[test]
    fn after_close_reveal_waits_for_close() {
        let now = Utc::now();
        let mut attempt = in_progress(vec![AttemptQuestion {
            question_id: 1,
            option_order: vec!["a".into(), "b".into(), "c".into()],
            max_score: 2.0,
        }]);
        attempt.status = AttemptStatus::Submitted;
        attempt.submitted_at = Some(now);
        attempt.score = Some(0.0);
        attempt.passed = Some(false);
        attempt.answers = Json(vec![GradedAnswer {
            question_id: 1,
            submitted: Some(AnswerValue::Text("b".into())),
            is_correct: false,
            score: 0.0,
            max_score: 2.0,
        }]);

        let mut e = exam(None);
        e.show_correct_answers = ShowCorrectAnswers::AfterClose;
        e.close_at = Some(now + Duration::hours(1));

        let before = attempt_view(&attempt, &e, &bank(), Viewer::student(9), now);
        let q = &before.questions[0];
        assert!(q.correct_option_ids.is_none());
        assert!(q.is_correct.is_none());
        assert!(q.explanation.is_none());
        assert_eq!(q.score, Some(0.0));

        let after = attempt_view(
            &attempt,
            &e,
            &bank(),
            Viewer::student(9),
            now + Duration::hours(2),
        );
        let q = &after.questions[0];
        assert_eq!(q.correct_option_ids, Some(vec!["a".to_string()]));
        assert_eq!(q.is_correct, Some(false));
        assert_eq!(q.explanation.as_deref(), Some("Because A"));

        // Without a close time the exam never closes.
        e.close_at = None;
        let open_ended = attempt_view(
            &attempt,
            &e,
            &bank(),
            Viewer::student(9),
            now + Duration::days(365),
        );
        assert!(open_ended.questions[0].correct_option_ids.is_none());
        assert!(open_ended.questions[0].explanation.is_none());
    }
}
