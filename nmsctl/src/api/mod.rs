//! HTTP API.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response bodies and query parameters
//!
//! # API Structure
//!
//! Everything is nested under `/api/v1`:
//!
//! - **Credentials** (`/credentials/*`): device credentials offered to discoveries
//! - **Discoveries** (`/discoveries/*`): address ranges to probe, run triggers and per-IP results
//! - **Provisions** (`/provisions/*`): monitors created from discovery results, and their metric groups
//! - **Polling results** (`/polling-results`): collected metric data

pub mod handlers;
pub mod models;
