//! # Mentor Rating Review
//!
//! The producing side of the rating pipeline: review mutations and the
//! events they emit.
//!
//! ```text
//! ReviewMutations::create / update / delete
//!     │ validate, CheckMentor, ownership
//!     ▼
//! ReviewStore (commit) ──► ReviewEventProducer ──► EventBus (key = review id)
//! ```
//!
//! - [`ReviewMutations`]: the write path
//! - [`ReviewEventProducer`]: event publishing with per-review sequence numbers
//! - [`ReviewStore`]: persistence contract, with [`InMemoryReviewStore`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod memory;
pub mod model;
pub mod mutations;
pub mod producer;
pub mod store;

pub use memory::InMemoryReviewStore;
pub use model::{NewReview, Review, ReviewChange, ReviewUpdate};
pub use mutations::{ReviewError, ReviewMutations};
pub use producer::ReviewEventProducer;
pub use store::{ReviewStore, ReviewStoreError};
