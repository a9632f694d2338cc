pub mod about;
pub mod annotation;
pub mod error;
pub mod external;
pub mod pipeline;
pub mod project;
pub mod rd_analysis;
pub mod read_length;
pub mod reference;
pub mod sample_set;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod snp_alignment;
pub mod stages;
pub mod tool_overrides;
pub mod tools;

#[cfg(test)]
mod testing;

pub use error::{ErrorCode, PipelineError};
pub use pipeline::Pipeline;
pub use stages::Stage;
