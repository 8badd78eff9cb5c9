// src/models/mod.rs

pub mod answer;
pub mod grade;
pub mod question;
pub mod results;
pub mod session;
