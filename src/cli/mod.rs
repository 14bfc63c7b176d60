pub mod commands;
pub mod progress;
pub mod ui;

pub use commands::run::RunOptions;
pub use progress::ConsoleRenderer;
pub use ui::Output;
