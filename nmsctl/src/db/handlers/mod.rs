//! Repository implementations for database access.
//!
//! Each repository wraps a `&mut PgConnection` (a pooled connection or an open transaction)
//! and returns models from [`crate::db::models`]:
//!
//! - [`Credentials`]: device credentials
//! - [`Discoveries`]: discoveries, their credential sets and per-IP results
//! - [`Monitors`]: provisioned devices and their metric groups
//! - [`PollingResults`]: append-only polling output
//!
//! ```ignore
//! use nmsctl::db::handlers::{Credentials, Repository};
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let mut repo = Credentials::new(&mut tx);
//!     let credentials = repo.list(&Default::default()).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod credentials;
pub mod discoveries;
pub mod monitors;
pub mod polling_results;
pub mod repository;

pub use credentials::Credentials;
pub use discoveries::Discoveries;
pub use monitors::Monitors;
pub use polling_results::PollingResults;
pub use repository::Repository;
