// src/handlers/mod.rs

pub mod admin;
pub mod attempt;
pub mod course;
pub mod exam;
