//! Schema Descriptor
//!
//! The static column listing of the one known table. Used both to ground the
//! prompt given to the model and to whitelist columns during validation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Columns of the applicant dataset, in file order.
pub const APPLICANT_COLUMNS: [&str; 9] = [
    "first_name",
    "last_name",
    "email",
    "phone",
    "education",
    "company",
    "years_of_experience",
    "work_experience",
    "skills",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Ordered (column, declared type) pairs for a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
}

impl SchemaDescriptor {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    /// The applicants table as the dashboard ships it: every column declared text.
    pub fn applicants() -> Self {
        Self::new(
            "applicants",
            APPLICANT_COLUMNS
                .iter()
                .map(|name| ColumnSpec::new(*name, "text"))
                .collect(),
        )
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Case-insensitive membership; SQLite identifiers are case-insensitive.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.table)?;
        for column in &self.columns {
            writeln!(f, "    - {} ({})", column.name, column.data_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applicants_schema_serializes_for_prompt() {
        let schema = SchemaDescriptor::applicants();
        let rendered = schema.to_string();

        assert!(rendered.starts_with("applicants\n"));
        assert!(rendered.contains("    - first_name (text)\n"));
        assert!(rendered.contains("    - skills (text)\n"));
        assert_eq!(schema.columns.len(), 9);
    }

    #[test]
    fn test_has_column_ignores_case() {
        let schema = SchemaDescriptor::applicants();
        assert!(schema.has_column("EMAIL"));
        assert!(schema.has_column("years_of_experience"));
        assert!(!schema.has_column("ssn"));
    }
}
