//! The Task Graph Engine: parse and validate a task graph document, then
//! drive its tasks through their lifecycle.

pub mod engine;
pub mod ingest;
pub mod schema;
pub mod validate;

pub use engine::{EngineState, GraphEngine, LoadSummary};
pub use ingest::{parse_path, parse_str, GraphFormat};
pub use schema::{GraphDocument, SessionDoc, TaskDoc};
pub use validate::{validate, ValidationReport};
