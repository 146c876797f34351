//! `PostgreSQL` storage for the mentor rating pipeline.
//!
//! - [`PostgresAggregateStore`]: the mentor aggregates, updated only through
//!   single-statement deltas, with per-review replay detection
//! - [`DeadLetterQueue`]: review events parked by the consumer after exhausting
//!   their apply attempts, with status management for manual follow-up
//!
//! Schema changes ship as embedded migrations; run [`migrate`] once at startup.
//!
//! # Example
//!
//! ```no_run
//! use mentor_rating_postgres::{connect, migrate, PostgresAggregateStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/mentors", 10).await?;
//! migrate(&pool).await?;
//!
//! let store = PostgresAggregateStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate_store;
pub mod dead_letter_queue;

pub use aggregate_store::PostgresAggregateStore;
pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, DeadLetterQueueError, FailedReviewEvent};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Apply the embedded migrations (`mentors`, `applied_review_events`,
/// `failed_review_events`).
///
/// # Errors
///
/// Returns the migration error if any migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
