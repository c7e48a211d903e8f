//! HTTP request handlers.
//!
//! Handlers stay thin: validate the request, call a repository, and keep the monitor cache in
//! step with whatever changed in the database.

pub mod credentials;
pub mod discoveries;
pub mod polling_results;
pub mod provisions;
