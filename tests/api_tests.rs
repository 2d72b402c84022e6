// tests/api_tests.rs

use std::{sync::Arc, time::Duration};

use coursework::{
    config::Config,
    models::course::{Course, Lesson, LessonStatus, Section},
    repository::{Repositories, memory::MemoryStore},
    routes,
    state::AppState,
    utils::jwt::{ROLE_ADMIN, ROLE_STUDENT, sign_jwt},
};
use serde_json::{Value, json};

const SECRET: &str = "test_secret_for_integration_tests";
const ADMIN_ID: i64 = 1;
const STUDENT_ID: i64 = 42;

struct TestApp {
    address: String,
    client: reqwest::Client,
    course: Course,
    section1: Section,
    lesson2: Lesson,
}

impl TestApp {
    fn token(&self, id: i64, role: &str) -> String {
        format!("Bearer {}", sign_jwt(id, role, SECRET, 600).unwrap())
    }

    fn admin(&self) -> String {
        self.token(ADMIN_ID, ROLE_ADMIN)
    }

    fn student(&self) -> String {
        self.token(STUDENT_ID, ROLE_STUDENT)
    }

    async fn post(&self, path: &str, auth: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("Authorization", auth)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    async fn get(&self, path: &str, auth: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .header("Authorization", auth)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Creates a single choice question (correct option "a") and returns its id.
    async fn create_question(&self, points: f64) -> i64 {
        let response = self
            .post(
                "/api/admin/questions",
                &self.admin(),
                json!({
                    "question_type": "single_choice",
                    "content": "Which keyword moves a value into a closure?",
                    "options": [
                        {"id": "a", "text": "move", "is_correct": true},
                        {"id": "b", "text": "ref"}
                    ],
                    "points": points
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.unwrap();
        body["id"].as_i64().unwrap()
    }

    /// Creates and publishes an exam over `question_ids`.
    async fn create_exam(&self, question_ids: &[i64], passing_score: f64, section_id: Option<i64>) -> i64 {
        let refs: Vec<Value> = question_ids
            .iter()
            .enumerate()
            .map(|(i, id)| json!({"question_id": id, "order": i + 1}))
            .collect();
        let response = self
            .post(
                "/api/admin/exams",
                &self.admin(),
                json!({
                    "course_id": self.course.id,
                    "section_id": section_id,
                    "title": "Ownership checkpoint",
                    "question_refs": refs,
                    "passing_score": passing_score,
                    "duration_minutes": 20
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201);
        let exam: Value = response.json().await.unwrap();
        assert_eq!(exam["status"], "draft");
        let id = exam["id"].as_i64().unwrap();

        let published = self
            .post(&format!("/api/admin/exams/{}/publish", id), &self.admin(), json!({}))
            .await;
        assert_eq!(published.status().as_u16(), 200);
        id
    }

    async fn enroll(&self) {
        let response = self
            .post(
                "/api/admin/enrollments",
                &self.admin(),
                json!({"student_id": STUDENT_ID, "course_id": self.course.id}),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201);
    }
}

/// Helper function to spawn the app on a random port for testing.
/// Uses the in-memory store seeded with one course of two sections.
async fn spawn_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let course = store.add_course("Rust in Practice").unwrap();
    let section1 = store.add_section(course.id, "Basics", 1).unwrap();
    let section2 = store.add_section(course.id, "Ownership", 2).unwrap();
    store
        .add_lesson(&section1, "Hello", 1, LessonStatus::Published)
        .unwrap();
    let lesson2 = store
        .add_lesson(&section2, "Borrowing", 1, LessonStatus::Published)
        .unwrap();

    let state = AppState::new(Config::for_tests(SECRET), Repositories::in_memory(store));
    let app = routes::create_router(state);

    // Bind to port 0 to get a random available port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        address: format!("http://127.0.0.1:{}", port),
        client: reqwest::Client::new(),
        course,
        section1,
        lesson2,
    }
}

#[tokio::test]
async fn health_check_404() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(format!("{}/random_path_that_does_not_exist", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn missing_or_bad_token_is_rejected() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(format!("{}/api/exams/1", app.address))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 401);

    let response = app.get("/api/exams/1", "Bearer not-a-token").await;
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn students_cannot_use_admin_routes() {
    let app = spawn_app().await;

    let response = app
        .post(
            "/api/admin/enrollments",
            &app.student(),
            json!({"student_id": STUDENT_ID, "course_id": app.course.id}),
        )
        .await;
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test]
async fn invalid_question_is_rejected() {
    let app = spawn_app().await;

    // Two correct options on a single choice question
    let response = app
        .post(
            "/api/admin/questions",
            &app.admin(),
            json!({
                "question_type": "single_choice",
                "content": "Pick one",
                "options": [
                    {"id": "a", "text": "A", "is_correct": true},
                    {"id": "b", "text": "B", "is_correct": true}
                ],
                "points": 1.0
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn exam_attempt_flow() {
    let app = spawn_app().await;
    let q1 = app.create_question(2.0).await;
    let q2 = app.create_question(3.0).await;
    let exam_id = app.create_exam(&[q1, q2], 2.0, None).await;

    // Not enrolled yet
    let response = app
        .post(&format!("/api/exams/{}/attempts", exam_id), &app.student(), json!({}))
        .await;
    assert_eq!(response.status().as_u16(), 403);

    app.enroll().await;

    let overview: Value = app
        .get(&format!("/api/exams/{}", exam_id), &app.student())
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(overview["can_start"], true);
    assert_eq!(overview["total_points"], 5.0);

    let started = app
        .post(&format!("/api/exams/{}/attempts", exam_id), &app.student(), json!({}))
        .await;
    assert_eq!(started.status().as_u16(), 201);
    let attempt: Value = started.json().await.unwrap();
    let attempt_id = attempt["id"].as_i64().unwrap();
    // The answer key is never sent while the attempt is running
    assert!(attempt["questions"][0].get("correct_option_ids").is_none());
    assert!(attempt["score"].is_null());

    let resumed = app
        .post(&format!("/api/exams/{}/attempts", exam_id), &app.student(), json!({}))
        .await;
    assert_eq!(resumed.status().as_u16(), 200);
    let resumed: Value = resumed.json().await.unwrap();
    assert_eq!(resumed["id"].as_i64(), Some(attempt_id));

    let submitted = app
        .post(
            &format!("/api/attempts/{}/submit", attempt_id),
            &app.student(),
            json!({"answers": {q1.to_string(): "a", q2.to_string(): "b"}}),
        )
        .await;
    assert_eq!(submitted.status().as_u16(), 200);
    let summary: Value = submitted.json().await.unwrap();
    assert_eq!(summary["score"], 2.0);
    assert_eq!(summary["max_score"], 5.0);
    assert_eq!(summary["passed"], true);
    assert_eq!(summary["status"], "submitted");

    let again = app
        .post(
            &format!("/api/attempts/{}/submit", attempt_id),
            &app.student(),
            json!({"answers": {q1.to_string(): "a"}}),
        )
        .await;
    assert_eq!(again.status().as_u16(), 409);

    let detail: Value = app
        .get(&format!("/api/attempts/{}", attempt_id), &app.student())
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(detail["questions"][0]["correct_option_ids"], json!(["a"]));

    let stranger = app
        .get(&format!("/api/attempts/{}", attempt_id), &app.token(99, ROLE_STUDENT))
        .await;
    assert_eq!(stranger.status().as_u16(), 403);

    // Progress is applied by the background worker
    let path = format!("/api/courses/{}/enrollment", app.course.id);
    let mut progress = 0;
    for _ in 0..50 {
        let body: Value = app.get(&path, &app.student()).await.json().await.unwrap();
        progress = body["enrollment"]["progress"].as_i64().unwrap_or(0);
        if progress > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(progress, 33);
}

#[tokio::test]
async fn section_exam_gates_later_lessons() {
    let app = spawn_app().await;
    let q = app.create_question(1.0).await;
    let exam_id = app.create_exam(&[q], 1.0, Some(app.section1.id)).await;
    app.enroll().await;

    let unlock_path = format!(
        "/api/courses/{}/unlock?lesson_id={}",
        app.course.id, app.lesson2.id
    );
    let decision: Value = app.get(&unlock_path, &app.student()).await.json().await.unwrap();
    assert_eq!(decision["unlocked"], false);
    assert_eq!(decision["blocking_exam"]["exam_id"].as_i64(), Some(exam_id));

    let complete_path = format!(
        "/api/courses/{}/lessons/{}/complete",
        app.course.id, app.lesson2.id
    );
    let blocked = app.post(&complete_path, &app.student(), json!({})).await;
    assert_eq!(blocked.status().as_u16(), 422);

    let attempt: Value = app
        .post(&format!("/api/exams/{}/attempts", exam_id), &app.student(), json!({}))
        .await
        .json()
        .await
        .unwrap();
    let attempt_id = attempt["id"].as_i64().unwrap();
    app.post(
        &format!("/api/attempts/{}/submit", attempt_id),
        &app.student(),
        json!({"answers": {q.to_string(): "a"}}),
    )
    .await;

    let mut unlocked = false;
    for _ in 0..50 {
        let decision: Value = app.get(&unlock_path, &app.student()).await.json().await.unwrap();
        if decision["unlocked"] == true {
            unlocked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(unlocked);

    let completed = app.post(&complete_path, &app.student(), json!({})).await;
    assert_eq!(completed.status().as_u16(), 200);
}

#[tokio::test]
async fn admin_recompute_and_certificate_retry() {
    let app = spawn_app().await;
    let enrollment: Value = app
        .post(
            "/api/admin/enrollments",
            &app.admin(),
            json!({"student_id": STUDENT_ID, "course_id": app.course.id}),
        )
        .await
        .json()
        .await
        .unwrap();
    let enrollment_id = enrollment["id"].as_i64().unwrap();

    let recomputed = app
        .post(
            &format!("/api/admin/enrollments/{}/recompute", enrollment_id),
            &app.admin(),
            json!({}),
        )
        .await;
    assert_eq!(recomputed.status().as_u16(), 200);
    let body: Value = recomputed.json().await.unwrap();
    assert_eq!(body["progress"], 0);
    assert_eq!(body["total_lessons"], 2);

    // Nothing to certify yet
    let retry = app
        .post(
            &format!("/api/admin/enrollments/{}/certificate", enrollment_id),
            &app.admin(),
            json!({}),
        )
        .await;
    assert_eq!(retry.status().as_u16(), 422);

    let missing = app
        .post("/api/admin/enrollments/999999/recompute", &app.admin(), json!({}))
        .await;
    assert_eq!(missing.status().as_u16(), 404);
}
