// src/utils/mod.rs

pub mod client;
