// src/routes.rs

use axum::{
    Router,
    http::Method,
    middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{admin, attempt, course, exam},
    state::AppState,
    utils::jwt::{admin_middleware, auth_middleware},
};

/// Assembles the main application router.
///
/// * Every route requires a bearer token; `/api/admin` also requires the admin role.
/// * Applies global middleware (Trace, CORS).
/// * Injects global state (services and config).
pub fn create_router(state: AppState) -> Router {
    let origins = [
        axum::http::HeaderValue::from_static("http://localhost:3000"),
        axum::http::HeaderValue::from_static("http://127.0.0.1:3000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let exam_routes = Router::new()
        .route("/{exam_id}", get(exam::get_exam_overview))
        .route("/{exam_id}/attempts", post(exam::start_attempt));

    let attempt_routes = Router::new()
        .route("/{attempt_id}", get(attempt::get_attempt))
        .route("/{attempt_id}/submit", post(attempt::submit_attempt));

    let course_routes = Router::new()
        .route("/{course_id}/unlock", get(course::check_unlock))
        .route("/{course_id}/enrollment", get(course::get_my_enrollment))
        .route(
            "/{course_id}/lessons/{lesson_id}/complete",
            post(course::complete_lesson),
        );

    let student_routes = Router::new()
        .nest("/api/exams", exam_routes)
        .nest("/api/attempts", attempt_routes)
        .nest("/api/courses", course_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let admin_routes = Router::new()
        .route("/questions", post(admin::create_question))
        .route("/questions/{id}", get(admin::get_question))
        .route("/questions/{id}/revisions", post(admin::revise_question))
        .route("/exams", post(admin::create_exam))
        .route("/exams/{id}/publish", post(admin::publish_exam))
        .route("/exams/{id}/archive", post(admin::archive_exam))
        .route("/enrollments", post(admin::create_enrollment))
        .route("/enrollments/{id}/recompute", post(admin::recompute_enrollment))
        .route("/enrollments/{id}/certificate", post(admin::retry_certificate))
        .route("/certificates/{id}/regenerate", post(admin::regenerate_certificate))
        // Double middleware protection: Auth first, then Admin check
        .layer(middleware::from_fn(admin_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(student_routes)
        .nest("/api/admin", admin_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
