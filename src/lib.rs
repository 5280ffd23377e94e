//! Generation job orchestrator
//!
//! Accepts image, video, audio and web generation requests, screens prompts,
//! queues jobs per mode, dispatches them to model backends and serves the
//! generated assets through signed URLs.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
