//! API request/response models.

pub mod credentials;
pub mod discoveries;
pub mod pagination;
pub mod polling_results;
pub mod provisions;
