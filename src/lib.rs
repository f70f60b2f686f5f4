pub mod config;
pub mod dashboard;
pub mod error;
pub mod guard;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod schema;
pub mod store;

pub use error::{DashboardError, Result};
pub use guard::{GuardPolicy, Rejection, ValidationChain, Verdict};
pub use pipeline::{PipelineStage, QueryOutcome, QueryPipeline};
pub use schema::SchemaDescriptor;
pub use store::{DatasetStore, ResultTable};
