// src/lib.rs — Library root for dropchat

pub mod auth;
pub mod infra;
pub mod orchestrator;
pub mod runtime;
pub mod store;
pub mod video;
