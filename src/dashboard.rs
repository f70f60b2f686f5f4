//! Applicant dashboard view
//!
//! The figures and filtering behind the applicant dashboard: an experience
//! range and a set of education levels select rows, and the summary boxes
//! report totals over the selection.

use crate::error::{DashboardError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub const EXPERIENCE_COLUMN: &str = "years_of_experience";
pub const EDUCATION_COLUMN: &str = "education";

/// Coarse education bucket for a free-text education entry.
///
/// Checked in order, so "BS/MS" counts as a bachelor's degree.
pub fn categorize_education(education: &str) -> &'static str {
    if education.contains("BS") || education.contains("Bachelor") {
        "Bachelor's"
    } else if education.contains("MS") || education.contains("Master") {
        "Master's"
    } else if education.contains("PhD") {
        "PhD"
    } else if education.contains("BE") {
        "BE"
    } else {
        "Other"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantFilter {
    pub min_experience: f64,
    pub max_experience: f64,
    pub education: Vec<String>,
}

impl ApplicantFilter {
    /// Full experience range and every education level: selects everything.
    pub fn reset(frame: &ApplicantFrame) -> Result<Self> {
        let (min_experience, max_experience) = frame
            .experience_range()?
            .unwrap_or((0.0, 0.0));
        Ok(Self {
            min_experience,
            max_experience,
            education: frame.education_levels()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantSummary {
    pub total_applicants: usize,
    pub average_experience: Option<f64>,
    pub most_common_education: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApplicantFrame {
    df: DataFrame,
}

impl ApplicantFrame {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading applicant frame from {:?}", path);

        let df = LazyCsvReader::new(path)
            .with_infer_schema_length(Some(1000))
            .finish()
            .map_err(|e| DashboardError::Dataset(format!("Failed to read CSV: {}", e)))?
            .collect()?;

        Self::from_frame(df)
    }

    pub fn from_frame(df: DataFrame) -> Result<Self> {
        for required in [EXPERIENCE_COLUMN, EDUCATION_COLUMN] {
            if df.column(required).is_err() {
                return Err(DashboardError::Dataset(format!(
                    "Applicant data is missing column '{}'",
                    required
                )));
            }
        }
        Ok(Self { df })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.df
    }

    pub fn height(&self) -> usize {
        self.df.height()
    }

    /// (min, max) years of experience; None when there are no values.
    pub fn experience_range(&self) -> Result<Option<(f64, f64)>> {
        let experience = self.experience()?;
        let values = experience.f64()?;
        Ok(values.min().zip(values.max()))
    }

    /// Distinct education values in first-seen order.
    pub fn education_levels(&self) -> Result<Vec<String>> {
        let mut levels: Vec<String> = Vec::new();
        let education = self.education()?;
        for value in education.str()?.into_iter().flatten() {
            if !levels.iter().any(|l| l == value) {
                levels.push(value.to_string());
            }
        }
        Ok(levels)
    }

    /// Rows with experience inside the inclusive range and an education level
    /// in the selection. An empty selection matches nothing.
    pub fn filter(&self, filter: &ApplicantFilter) -> Result<Self> {
        let experience = col(EXPERIENCE_COLUMN).cast(DataType::Float64);
        let in_range = experience
            .clone()
            .gt_eq(lit(filter.min_experience))
            .and(experience.lt_eq(lit(filter.max_experience)));
        let in_selection = filter.education.iter().fold(lit(false), |acc, level| {
            acc.or(col(EDUCATION_COLUMN).eq(lit(level.as_str())))
        });

        let df = self
            .df
            .clone()
            .lazy()
            .filter(in_range.and(in_selection))
            .collect()?;
        debug!("Filter kept {} of {} applicants", df.height(), self.df.height());

        Ok(Self { df })
    }

    pub fn summary(&self) -> Result<ApplicantSummary> {
        let total_applicants = self.df.height();
        if total_applicants == 0 {
            return Ok(ApplicantSummary {
                total_applicants,
                average_experience: None,
                most_common_education: None,
            });
        }

        let experience = self.experience()?;
        let average_experience = experience.f64()?.mean();

        let counts = self.education_counts()?;
        let mut most_common: Option<(String, usize)> = None;
        for (level, count) in counts {
            // Strictly greater: ties keep the first-seen level
            if most_common.as_ref().map_or(true, |(_, best)| count > *best) {
                most_common = Some((level, count));
            }
        }

        Ok(ApplicantSummary {
            total_applicants,
            average_experience,
            most_common_education: most_common.map(|(level, _)| level),
        })
    }

    /// Applicant counts per education category, in category first-seen order.
    pub fn education_breakdown(&self) -> Result<Vec<(&'static str, usize)>> {
        let mut breakdown: Vec<(&'static str, usize)> = Vec::new();
        for (level, count) in self.education_counts()? {
            let category = categorize_education(&level);
            match breakdown.iter_mut().find(|(c, _)| *c == category) {
                Some((_, total)) => *total += count,
                None => breakdown.push((category, count)),
            }
        }
        Ok(breakdown)
    }

    fn education_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        let education = self.education()?;
        for value in education.str()?.into_iter().flatten() {
            match counts.iter_mut().find(|(level, _)| level == value) {
                Some((_, count)) => *count += 1,
                None => counts.push((value.to_string(), 1)),
            }
        }
        Ok(counts)
    }

    fn experience(&self) -> Result<Series> {
        Ok(self.df.column(EXPERIENCE_COLUMN)?.cast(&DataType::Float64)?)
    }

    fn education(&self) -> Result<Series> {
        Ok(self.df.column(EDUCATION_COLUMN)?.cast(&DataType::String)?)
    }
}
