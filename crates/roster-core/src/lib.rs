//! roster-core: embeddings, identity matching and the attendance data model.
//!
//! Embeddings arrive already extracted by the edge camera pipeline; this crate
//! only compares them against the enrolled catalog.

pub mod clock;
pub mod index;
pub mod matcher;
pub mod types;
pub mod viewer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use matcher::{Gallery, IdentityMatch, MatchError, MatcherConfig, NoMatchReason};
pub use types::{AttendanceEvent, AttendanceMethod, Embedding, EmbeddingError, Identity, EMBEDDING_DIM};
