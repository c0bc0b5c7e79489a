pub mod db;
pub mod domain;
pub mod embedding;
pub mod fuzzy;
pub mod index;
pub mod models;
pub mod processing;
pub mod repository;
pub mod schema;

/// Default number of candidates returned by a similarity search.
pub const DEFAULT_TOP_K: usize = 5;

/// Default score gap within which the top two candidates are treated as
/// indistinguishable and a match is reported as ambiguous.
pub const DEFAULT_AMBIGUITY_MARGIN: f32 = 0.02;
