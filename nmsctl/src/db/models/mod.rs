//! Database record models matching table schemas.
//!
//! These structs correspond to table rows and are returned by the repositories in
//! [`crate::db::handlers`]. API models in [`crate::api::models`] are kept separate so the
//! storage and wire representations can evolve independently (credential passwords, for
//! example, never leave the database layer through the API).

pub mod credentials;
pub mod discoveries;
pub mod monitors;
pub mod polling_results;
