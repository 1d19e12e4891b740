//! Fixed-capacity time-bucketing aggregation.
//!
//! Events are quantized into fixed-width buckets held in a per-group ring
//! buffer. Declared fields aggregate each event into the current bucket,
//! derived expressions run over windowed series queries, and buckets advance
//! on a timer (live) or on boundary crossings (replay).

pub mod catalog;
pub mod error;
pub mod expr;
pub mod runtime;
pub mod series;
pub mod state;
mod stats;
pub mod types;

pub use catalog::{Catalog, FieldDecl, FieldDecls, FieldKind, NamedField};
pub use error::{ConfigError, QueryError, SamplerError};
pub use expr::{Expression, ExpressionSet};
pub use runtime::{
    BucketSnapshot, SamplerListener, SamplingBuffer, SharedTrack, Track, TrackSnapshot,
};
pub use series::{Series, SeriesSet};
pub use state::{Bucket, RingBuffer};
pub use types::{
    AdvanceReason, Datum, Event, IteratorPosition, SampleClock, SamplerOptions, Timestamp,
};

#[cfg(test)]
mod tests;
