// src/models/mod.rs

pub mod attempt;
pub mod certificate;
pub mod course;
pub mod enrollment;
pub mod exam;
pub mod progress;
pub mod question;
