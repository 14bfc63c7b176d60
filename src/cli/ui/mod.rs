mod output;

pub use output::{Output, status_icon};
