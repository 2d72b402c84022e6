// src/services/grading.rs
//
// Pure grading functions. No storage, no clock.

use std::collections::HashMap;

use crate::{
    error::AppError,
    models::{
        attempt::{AnswerValue, GradedAnswer},
        exam::QuestionRef,
        question::{Question, QuestionType},
    },
};

/// Outcome of grading a whole submission.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeReport {
    /// One entry per question referenced by the exam, in exam order.
    pub answers: Vec<GradedAnswer>,
    /// Raw sum of per-question scores, before late penalty and clamping.
    pub total_score: f64,
    pub total_max_score: f64,
    pub correct_count: usize,
    pub answered_count: usize,
}

/// `(point override or points) * weight`.
pub fn max_score_for(question: &Question, question_ref: &QuestionRef) -> f64 {
    question_ref.point_override.unwrap_or(question.points) * question_ref.weight
}

/// Trim, and lowercase unless the comparison is case sensitive.
pub fn normalize(text: &str, case_sensitive: bool) -> String {
    let trimmed = text.trim();
    if case_sensitive {
        trimmed.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

fn is_correct(question: &Question, submitted: &AnswerValue) -> bool {
    match question.question_type {
        QuestionType::SingleChoice => {
            let selected = submitted.selected_ids();
            let correct = question.correct_option_ids();
            selected.len() == 1 && correct.len() == 1 && selected[0] == correct[0]
        }
        // Exact set match, no partial credit.
        QuestionType::MultipleChoice => submitted.selected_ids() == question.correct_option_ids(),
        QuestionType::ShortAnswer => {
            let text = match submitted {
                AnswerValue::Text(text) => text.as_str(),
                AnswerValue::Choices(values) if values.len() == 1 => values[0].as_str(),
                AnswerValue::Choices(_) => return false,
            };
            question.expected_answers.iter().any(|expected| {
                normalize(text, expected.case_sensitive)
                    == normalize(&expected.text, expected.case_sensitive)
            })
        }
    }
}

/// Grades a single question. Blank answers score 0 and are never penalized.
pub fn grade_answer(
    question: &Question,
    question_ref: &QuestionRef,
    submitted: Option<&AnswerValue>,
) -> GradedAnswer {
    grade_answer_with_max(
        question,
        question_ref,
        max_score_for(question, question_ref),
        submitted,
    )
}

/// Like [`grade_answer`], awarding `max_score` for a correct answer instead
/// of the question's current points.
pub fn grade_answer_with_max(
    question: &Question,
    question_ref: &QuestionRef,
    max_score: f64,
    submitted: Option<&AnswerValue>,
) -> GradedAnswer {
    let answered = submitted.filter(|answer| !answer.is_blank());

    let (correct, score) = match answered {
        None => (false, 0.0),
        Some(answer) if is_correct(question, answer) => (true, max_score),
        Some(_) if question.negative_marking => {
            (false, -question.negative_points * question_ref.weight)
        }
        Some(_) => (false, 0.0),
    };

    GradedAnswer {
        question_id: question.id,
        submitted: answered.cloned(),
        is_correct: correct,
        score,
        max_score,
    }
}

/// Grades every question referenced by `refs`, answered or not.
///
/// `questions` must contain every referenced question id. A question found in
/// `frozen_max` is scored out of that value, otherwise out of its current
/// points.
pub fn grade(
    refs: &[QuestionRef],
    questions: &HashMap<i64, Question>,
    frozen_max: &HashMap<i64, f64>,
    submitted: &HashMap<i64, AnswerValue>,
) -> Result<GradeReport, AppError> {
    let mut answers = Vec::with_capacity(refs.len());
    let mut total_score = 0.0;
    let mut total_max_score = 0.0;
    let mut correct_count = 0;
    let mut answered_count = 0;

    for question_ref in refs {
        let question = questions.get(&question_ref.question_id).ok_or_else(|| {
            AppError::InternalServerError(format!(
                "Question {} referenced by exam is missing",
                question_ref.question_id
            ))
        })?;

        let max_score = frozen_max
            .get(&question.id)
            .copied()
            .unwrap_or_else(|| max_score_for(question, question_ref));
        let graded =
            grade_answer_with_max(question, question_ref, max_score, submitted.get(&question.id));
        total_score += graded.score;
        total_max_score += graded.max_score;
        if graded.is_correct {
            correct_count += 1;
        }
        if graded.submitted.is_some() {
            answered_count += 1;
        }
        answers.push(graded);
    }

    Ok(GradeReport {
        answers,
        total_score,
        total_max_score,
        correct_count,
        answered_count,
    })
}

/// Applies the late penalty (when late) and clamps the attempt score at zero.
pub fn final_score(total_score: f64, is_late: bool, late_penalty_percent: f64) -> f64 {
    let penalized = if is_late {
        total_score - total_score * late_penalty_percent / 100.0
    } else {
        total_score
    };
    penalized.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::question::{ExpectedAnswer, QuestionOption};
    use sqlx::types::Json;

    fn choice(id: i64, question_type: QuestionType, correct: &[&str], points: f64) -> Question {
        let options = ["a", "b", "c", "d"]
            .iter()
            .map(|opt| QuestionOption {
                id: opt.to_string(),
                text: opt.to_uppercase(),
                is_correct: correct.contains(opt),
            })
            .collect();
        Question {
            id,
            question_type,
            content: format!("Question {}", id),
            options: Json(options),
            expected_answers: Json(vec![]),
            points,
            negative_marking: false,
            negative_points: 0.0,
            explanation: None,
            version: 1,
            parent_id: None,
            is_archived: false,
            created_at: None,
        }
    }

    fn short(id: i64, answer: &str, case_sensitive: bool) -> Question {
        Question {
            question_type: QuestionType::ShortAnswer,
            options: Json(vec![]),
            expected_answers: Json(vec![ExpectedAnswer {
                text: answer.to_string(),
                case_sensitive,
            }]),
            ..choice(id, QuestionType::ShortAnswer, &[], 2.0)
        }
    }

    fn plain_ref(question_id: i64, order: i32) -> QuestionRef {
        QuestionRef {
            question_id,
            order,
            weight: 1.0,
            point_override: None,
        }
    }

    fn text(s: &str) -> AnswerValue {
        AnswerValue::Text(s.to_string())
    }

    #[test]
    fn seven_of_twelve_passes() {
        let points = [1.0, 1.0, 2.0, 3.0, 2.0, 3.0];
        let questions: HashMap<i64, Question> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let id = i as i64 + 1;
                (id, choice(id, QuestionType::SingleChoice, &["a"], *p))
            })
            .collect();
        let refs: Vec<QuestionRef> = (1..=6).map(|id| plain_ref(id, id as i32)).collect();
        let submitted: HashMap<i64, AnswerValue> = (1..=4).map(|id| (id, text("a"))).collect();

        let report = grade(&refs, &questions, &HashMap::new(), &submitted).unwrap();
        assert_eq!(report.total_score, 7.0);
        assert_eq!(report.total_max_score, 12.0);
        assert_eq!(report.answers.len(), 6);
        assert_eq!(report.answered_count, 4);
        assert!(final_score(report.total_score, false, 0.0) >= 7.0);
    }

    #[test]
    fn frozen_max_score_survives_point_edits() {
        // Frozen at 5 when the attempt started, edited to 8 since.
        let questions = HashMap::from([(1, choice(1, QuestionType::SingleChoice, &["a"], 8.0))]);
        let refs = vec![plain_ref(1, 1)];
        let submitted = HashMap::from([(1, text("a"))]);

        let frozen = grade(&refs, &questions, &HashMap::from([(1, 5.0)]), &submitted).unwrap();
        assert_eq!(frozen.answers[0].score, 5.0);
        assert_eq!(frozen.answers[0].max_score, 5.0);
        assert_eq!(frozen.total_score, 5.0);
        assert_eq!(frozen.total_max_score, 5.0);

        let live = grade(&refs, &questions, &HashMap::new(), &submitted).unwrap();
        assert_eq!(live.answers[0].max_score, 8.0);
    }

    #[test]
    fn multiple_choice_has_no_partial_credit() {
        let q = choice(1, QuestionType::MultipleChoice, &["a", "c"], 4.0);
        let r = plain_ref(1, 1);

        let partial = grade_answer(&q, &r, Some(&AnswerValue::Choices(vec!["a".into()])));
        assert!(!partial.is_correct);
        assert_eq!(partial.score, 0.0);

        let exact = grade_answer(&q, &r, Some(&AnswerValue::Choices(vec!["c".into(), "a".into()])));
        assert!(exact.is_correct);
        assert_eq!(exact.score, 4.0);
    }

    #[test]
    fn negative_marking_only_for_answered_questions() {
        let mut q = choice(1, QuestionType::SingleChoice, &["a"], 2.0);
        q.negative_marking = true;
        q.negative_points = 0.5;
        let r = QuestionRef {
            weight: 2.0,
            ..plain_ref(1, 1)
        };

        let wrong = grade_answer(&q, &r, Some(&text("b")));
        assert_eq!(wrong.score, -1.0);
        assert_eq!(wrong.max_score, 4.0);

        let blank = grade_answer(&q, &r, None);
        assert_eq!(blank.score, 0.0);

        let whitespace = grade_answer(&q, &r, Some(&text("  ")));
        assert_eq!(whitespace.score, 0.0);
        assert!(whitespace.submitted.is_none());
    }

    #[test]
    fn point_override_and_weight() {
        let q = choice(1, QuestionType::SingleChoice, &["a"], 2.0);
        let r = QuestionRef {
            question_id: 1,
            order: 1,
            weight: 1.5,
            point_override: Some(4.0),
        };
        assert_eq!(max_score_for(&q, &r), 6.0);
    }

    #[test]
    fn short_answer_normalization() {
        let insensitive = short(1, " Paris ", false);
        let r = plain_ref(1, 1);
        assert!(grade_answer(&insensitive, &r, Some(&text("paris"))).is_correct);

        let sensitive = short(2, "Paris", true);
        assert!(!grade_answer(&sensitive, &plain_ref(2, 1), Some(&text("paris"))).is_correct);
        assert!(grade_answer(&sensitive, &plain_ref(2, 1), Some(&text("  Paris"))).is_correct);
    }

    #[test]
    fn single_choice_rejects_multiple_selections() {
        let q = choice(1, QuestionType::SingleChoice, &["a"], 1.0);
        let answer = AnswerValue::Choices(vec!["a".into(), "b".into()]);
        assert!(!grade_answer(&q, &plain_ref(1, 1), Some(&answer)).is_correct);
    }

    #[test]
    fn late_penalty_and_clamp() {
        assert_eq!(final_score(10.0, true, 20.0), 8.0);
        assert_eq!(final_score(10.0, false, 20.0), 10.0);
        assert_eq!(final_score(-3.0, false, 0.0), 0.0);
        assert_eq!(final_score(10.0, true, 100.0), 0.0);
    }

    #[test]
    fn missing_question_is_an_error() {
        let refs = vec![plain_ref(99, 1)];
        let result = grade(&refs, &HashMap::new(), &HashMap::new(), &HashMap::new());
        assert!(matches!(result, Err(AppError::InternalServerError(_))));
    }
}
