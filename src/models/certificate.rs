// src/models/certificate.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};

use crate::models::enrollment::CompletionSnapshot;

/// Asset generation state of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "certificate_status", rename_all = "snake_case")]
pub enum CertificateStatus {
    Pending,
    Generated,
    Failed,
}

/// Represents the 'certificates' table. At most one row per enrollment.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Certificate {
    pub id: i64,
    pub enrollment_id: i64,
    pub student_id: i64,
    pub course_id: i64,
    /// Public verification code.
    pub code: String,
    pub snapshot: Json<CompletionSnapshot>,
    pub status: CertificateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_html: Option<String>,
    pub generation_attempts: i32,
    pub last_error: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Fields of a certificate row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub enrollment_id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub code: String,
    pub snapshot: CompletionSnapshot,
    pub issued_at: DateTime<Utc>,
}
