pub mod artifacts;
pub mod database;
pub mod sink;

pub use artifacts::{FileArtifactSink, slugify};
pub use database::{Database, PoolConfig, SharedDatabase, StoredWorkItem};
pub use sink::SqliteFindingSink;
