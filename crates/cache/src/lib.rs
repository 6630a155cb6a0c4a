//! vlayer Cache - Feature cache over vector layers.
//!
//! This crate provides:
//!
//! - `cache`: The feature cache and its statistics
//! - `index`: Cache index extension point and a request result index
//! - `iterators`: Iterators serving from the cache and filling it
//! - `settings`: Cache configuration

pub mod cache;
pub mod index;
pub mod iterators;
pub mod settings;

pub use cache::{CacheStats, FeatureCache};
pub use index::{CacheIndex, RequestResultIndex};
pub use iterators::{CachedFeatureIterator, CachedFeatureWriterIterator};
pub use settings::CacheSettings;
