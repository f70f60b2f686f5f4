//! Prompt Builder
//!
//! Deterministically turns a question and the schema into the instruction
//! handed to the language model.

use crate::error::{DashboardError, Result};
use crate::schema::SchemaDescriptor;
use serde::{Deserialize, Serialize};

/// A system instruction plus the user's question, sent as two chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub struct PromptBuilder {
    schema: SchemaDescriptor,
}

impl PromptBuilder {
    pub fn new(schema: SchemaDescriptor) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn build(&self, question: &str) -> Result<Prompt> {
        let question = question.trim();
        if question.is_empty() {
            return Err(DashboardError::InvalidRequest(
                "question must not be empty".to_string(),
            ));
        }

        Ok(Prompt {
            system: self.system_instruction(),
            user: question.to_string(),
        })
    }

    fn system_instruction(&self) -> String {
        format!(
            "You are a professional sqlite3 query writer. The user will provide you \
             with a natural language question and your job is to write exactly one SQL \
             query answering it, based on the schema of the {table} database:\n{schema}\n\
             Think step-by-step through the process to make sure the query makes sense \
             and only uses columns that actually exist in the table. Write string values \
             in single quotes. Only output the SQL \
             query and make sure to add ';' at the end so the query can be run. Your \
             output will be used in a function to query a database so it is important \
             not to return any other text in your response. Do not include any explanation.",
            table = self.schema.table,
            schema = self.schema,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_grounds_prompt_in_schema() {
        let builder = PromptBuilder::new(SchemaDescriptor::applicants());
        let prompt = builder.build("  How many applicants do I have?  ").unwrap();

        assert_eq!(prompt.user, "How many applicants do I have?");
        assert!(prompt.system.contains("exactly one SQL query"));
        assert!(prompt.system.contains("    - years_of_experience (text)"));
        assert!(prompt.system.contains("add ';' at the end"));
        assert!(prompt.system.contains("string values in single quotes"));
        assert!(prompt.system.contains("Do not include any explanation"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = PromptBuilder::new(SchemaDescriptor::applicants());
        assert_eq!(builder.build("q").unwrap(), builder.build("q").unwrap());
    }

    #[test]
    fn test_blank_question_rejected() {
        let builder = PromptBuilder::new(SchemaDescriptor::applicants());
        assert!(matches!(
            builder.build("   "),
            Err(DashboardError::InvalidRequest(_))
        ));
    }
}
