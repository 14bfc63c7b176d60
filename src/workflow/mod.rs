//! Stage Runner / Workflow Engine
//!
//! ```text
//! collect ─┬─> mine ──┬─> aggregate ─> write
//!          └─> audit ─┘
//! ```
//!
//! - `dag`: static stage/edge declaration and validation
//! - `stage`: the `Stage` trait and its read-only context
//! - `items`: per-item fan-out with failure isolation
//! - `runner`: the join loop that owns `PipelineState`
//! - `progress`: broadcast progress events

pub mod dag;
pub mod items;
pub mod progress;
pub mod runner;
pub mod stage;
pub mod state;

pub use dag::{Dependency, Workflow, WorkflowBuilder};
pub use items::process_items;
pub use progress::{MessageLevel, ProgressEvent, ProgressState, ProgressTracker};
pub use runner::WorkflowRunner;
pub use stage::{SharedStage, Stage, StageContext};
pub use state::{PipelineState, PipelineStatus};
