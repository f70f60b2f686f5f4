//! Guarded query pipeline
//!
//! `Received -> Prompted -> Generated -> Validated -> Executed`, or
//! `... -> Generated -> Rejected`. Strictly sequential: one generation
//! attempt, no retries, and nothing reaches the store unless every
//! validator accepted the statement.

use crate::error::{DashboardError, Result};
use crate::guard::{GuardPolicy, Rejection, ValidationChain, Verdict};
use crate::llm::{extract_statement, CompletionService, DEFAULT_TIMEOUT_SECS};
use crate::prompt::PromptBuilder;
use crate::schema::SchemaDescriptor;
use crate::store::{DatasetStore, ResultTable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Received,
    Prompted,
    Generated,
    Validated,
    Executed,
    Rejected,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Received => "received",
            PipelineStage::Prompted => "prompted",
            PipelineStage::Generated => "generated",
            PipelineStage::Validated => "validated",
            PipelineStage::Executed => "executed",
            PipelineStage::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Terminal result of one `ask`. Generation and execution failures are
/// returned as errors instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOutcome {
    Answered { sql: String, table: ResultTable },
    Rejected { sql: String, reason: Rejection },
}

impl QueryOutcome {
    pub fn sql(&self) -> &str {
        match self {
            QueryOutcome::Answered { sql, .. } | QueryOutcome::Rejected { sql, .. } => sql,
        }
    }

    pub fn terminal_stage(&self) -> PipelineStage {
        match self {
            QueryOutcome::Answered { .. } => PipelineStage::Executed,
            QueryOutcome::Rejected { .. } => PipelineStage::Rejected,
        }
    }
}

pub struct QueryPipeline {
    prompts: PromptBuilder,
    generator: Arc<dyn CompletionService>,
    chain: ValidationChain,
    store: Arc<DatasetStore>,
    generation_timeout: Duration,
}

impl QueryPipeline {
    pub fn new(
        schema: SchemaDescriptor,
        policy: &GuardPolicy,
        generator: Arc<dyn CompletionService>,
        store: Arc<DatasetStore>,
    ) -> Result<Self> {
        let chain = ValidationChain::new(policy, &schema)?;
        Ok(Self {
            prompts: PromptBuilder::new(schema),
            generator,
            chain,
            store,
            generation_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        self.prompts.schema()
    }

    /// Run only the validation chain. Never touches the store.
    pub fn validate(&self, sql: &str) -> Verdict {
        self.chain.validate(sql)
    }

    pub async fn ask(&self, question: &str) -> Result<QueryOutcome> {
        info!("Question received: {}", question);

        let prompt = self.prompts.build(question)?;
        enter(PipelineStage::Prompted);

        let raw = tokio::time::timeout(self.generation_timeout, self.generator.complete(&prompt))
            .await
            .map_err(|_| {
                DashboardError::Generation(format!(
                    "model did not answer within {:?}",
                    self.generation_timeout
                ))
            })?
            .map_err(|e| match e {
                DashboardError::Generation(_) => e,
                other => DashboardError::Generation(other.to_string()),
            })?;
        let sql = extract_statement(&raw)?;
        enter(PipelineStage::Generated);
        info!("Generated SQL: {}", sql);

        if let Verdict::Rejected(reason) = self.chain.validate(&sql) {
            enter(PipelineStage::Rejected);
            warn!("Rejected by {}: {}", reason.rule(), reason);
            return Ok(QueryOutcome::Rejected { sql, reason });
        }
        enter(PipelineStage::Validated);

        let store = Arc::clone(&self.store);
        let statement = sql.clone();
        let table = tokio::task::spawn_blocking(move || store.query(&statement))
            .await
            .map_err(|e| DashboardError::Execution(format!("query task failed: {}", e)))?
            .map_err(|e| match e {
                DashboardError::Execution(_) => e,
                other => DashboardError::Execution(other.to_string()),
            })?;
        enter(PipelineStage::Executed);
        info!("Query returned {} rows", table.len());

        Ok(QueryOutcome::Answered { sql, table })
    }
}

fn enter(stage: PipelineStage) {
    debug!("pipeline stage: {}", stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FixedCompletion;
    use crate::prompt::Prompt;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    struct CountingCompletion {
        calls: AtomicUsize,
        response: Result<String>,
    }

    #[async_trait]
    impl CompletionService for CountingCompletion {
        async fn complete(&self, _prompt: &Prompt) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(DashboardError::Generation(e.to_string())),
            }
        }
    }

    struct SlowCompletion;

    #[async_trait]
    impl CompletionService for SlowCompletion {
        async fn complete(&self, _prompt: &Prompt) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("SELECT COUNT(*) FROM applicants;".to_string())
        }
    }

    fn store() -> Arc<DatasetStore> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"first_name,education\nAda,PhD\nAlan,BS\n").unwrap();
        Arc::new(DatasetStore::from_csv(file.path(), "applicants").unwrap())
    }

    fn pipeline(generator: Arc<dyn CompletionService>) -> QueryPipeline {
        let store = store();
        let schema = store.describe_schema().unwrap();
        QueryPipeline::new(schema, &GuardPolicy::default(), generator, store).unwrap()
    }

    #[tokio::test]
    async fn test_answered_outcome() {
        let p = pipeline(Arc::new(FixedCompletion::new(
            "```sql\nSELECT COUNT(*) AS total FROM applicants;\n```",
        )));
        let outcome = p.ask("How many applicants?").await.unwrap();

        assert_eq!(outcome.terminal_stage(), PipelineStage::Executed);
        assert_eq!(outcome.sql(), "SELECT COUNT(*) AS total FROM applicants;");
        match outcome {
            QueryOutcome::Answered { table, .. } => {
                assert_eq!(table.columns, vec!["total"]);
                assert_eq!(table.rows, vec![vec![serde_json::json!(2)]]);
            }
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generation_attempted_once_on_failure() {
        let generator = Arc::new(CountingCompletion {
            calls: AtomicUsize::new(0),
            response: Err(DashboardError::Generation("503".to_string())),
        });
        let p = pipeline(generator.clone());

        assert!(matches!(
            p.ask("anything").await,
            Err(DashboardError::Generation(_))
        ));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_model_output_is_generation_error() {
        let p = pipeline(Arc::new(FixedCompletion::new("  \n ")));
        assert!(matches!(
            p.ask("anything").await,
            Err(DashboardError::Generation(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_question_never_reaches_model() {
        let generator = Arc::new(CountingCompletion {
            calls: AtomicUsize::new(0),
            response: Ok("SELECT 1;".to_string()),
        });
        let p = pipeline(generator.clone());

        assert!(matches!(
            p.ask("   ").await,
            Err(DashboardError::InvalidRequest(_))
        ));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generation_timeout() {
        let p = pipeline(Arc::new(SlowCompletion)).with_generation_timeout(Duration::from_millis(50));
        let err = p.ask("How many applicants?").await.unwrap_err();
        assert!(matches!(err, DashboardError::Generation(_)));
    }

    #[tokio::test]
    async fn test_execution_error_surfaces() {
        // Passes every rule but fails in SQLite: unknown table
        let p = pipeline(Arc::new(FixedCompletion::new("SELECT first_name FROM employees;")));
        assert!(matches!(
            p.ask("Who works here?").await,
            Err(DashboardError::Execution(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_outcome_stage() {
        let p = pipeline(Arc::new(FixedCompletion::new("PRAGMA query_only = 0;")));
        let outcome = p.ask("Turn off read-only mode").await.unwrap();

        assert_eq!(outcome.terminal_stage(), PipelineStage::Rejected);
        assert_eq!(outcome.sql(), "PRAGMA query_only = 0;");
        assert!(p.store.is_read_only().unwrap());
    }

    #[test]
    fn test_validate_does_not_touch_store() {
        let p = pipeline(Arc::new(FixedCompletion::new("unused")));
        assert!(matches!(
            p.validate("DROP TABLE applicants;"),
            Verdict::Rejected(Rejection::ForbiddenStatementType(_))
        ));
        assert_eq!(p.store.row_count().unwrap(), 2);
    }
}
