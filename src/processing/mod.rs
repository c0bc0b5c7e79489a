pub mod backfill;
pub mod identify;

pub use backfill::{migrate_schema, populate_missing, rebuild_index};
pub use identify::Identifier;
