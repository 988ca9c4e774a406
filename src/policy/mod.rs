pub mod defaults;
pub mod engine;
pub mod parser;
pub mod types;

pub use engine::{Evaluation, PolicyEngine};
pub use types::*;
