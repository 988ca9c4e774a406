pub mod reader;
pub mod sink;
pub mod types;

pub use reader::{AuditFilter, AuditReader};
pub use sink::AuditSink;
pub use types::*;
