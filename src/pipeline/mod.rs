//! The request stages, in execution order. Each stage owns no state beyond
//! its compiled prompt templates; models and limits are passed per call.

pub mod prompts;

pub mod assemble;
pub mod consistency;
pub mod plan;
pub mod retrieve;
pub mod understand;
pub mod write;

pub use assemble::ContextAssembler;
pub use consistency::{ConsistencyChecker, check_rules};
pub use plan::Planner;
pub use prompts::PromptSet;
pub use retrieve::{Retriever, merge_results};
pub use understand::QueryUnderstander;
pub use write::{TextStream, Writer};
