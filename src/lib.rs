//! Detection request deduplication service
//!
//! This library provides the core functionality for the detect-dedup system,
//! which fingerprints submitted images, serves repeat requests from a result
//! cache, and makes sure at most one detection job runs per distinct image.
//! Inference runs on separate worker processes fed by a Redis queue, with
//! images and annotated artifacts kept in R2 storage.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
