use applicant_dashboard::config::LlmSettings;
use applicant_dashboard::dashboard::{ApplicantFilter, ApplicantFrame};
use applicant_dashboard::guard::{GuardPolicy, ValidationChain, Verdict};
use applicant_dashboard::llm::{CompletionService, FixedCompletion};
use applicant_dashboard::pipeline::{QueryOutcome, QueryPipeline};
use applicant_dashboard::store::DatasetStore;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "applicant-dashboard")]
#[command(about = "Applicant data dashboard with a guarded natural-language SQL query")]
#[command(version)]
struct Args {
    /// Applicant CSV file
    #[arg(long, global = true, default_value = "data/applicants.csv")]
    data: PathBuf,

    /// Table name the dataset is loaded under
    #[arg(long, global = true, default_value = "applicants")]
    table: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question in natural language; the generated SQL is checked before it runs
    Ask {
        question: String,

        /// JSON guard policy (denylist, columns, require_terminator)
        #[arg(long)]
        policy: Option<PathBuf>,

        /// OpenAI API key (or set OPENAI_API_KEY env var)
        #[arg(long)]
        api_key: Option<String>,

        /// Answer with this SQL instead of calling the model
        #[arg(long)]
        stub_sql: Option<String>,
    },
    /// Run the guardrails on a SQL statement without executing it
    Check {
        sql: String,

        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Print the schema of the loaded dataset
    Schema,
    /// Print the dashboard summary figures
    Summary,
    /// Filter applicants by experience range and education level
    Filter {
        /// Minimum years of experience (default: dataset minimum)
        #[arg(long)]
        min: Option<f64>,

        /// Maximum years of experience (default: dataset maximum)
        #[arg(long)]
        max: Option<f64>,

        /// Education level to include; repeat for several (default: all)
        #[arg(long)]
        education: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Ask { question, policy, api_key, stub_sql } => {
            ask(&args.data, &args.table, &question, policy, api_key, stub_sql).await
        }
        Commands::Check { sql, policy } => check(&args.data, &args.table, &sql, policy),
        Commands::Schema => {
            let store = load_store(&args.data, &args.table)?;
            print!("{}", store.describe_schema()?);
            Ok(())
        }
        Commands::Summary => summary(&args.data),
        Commands::Filter { min, max, education } => filter(&args.data, min, max, education),
    }
}

fn load_store(data: &Path, table: &str) -> Result<DatasetStore> {
    DatasetStore::from_csv(data, table)
        .with_context(|| format!("Failed to load dataset from {:?}", data))
}

fn load_policy(path: Option<PathBuf>) -> Result<GuardPolicy> {
    match path {
        Some(path) => GuardPolicy::load(&path)
            .with_context(|| format!("Failed to load guard policy from {:?}", path)),
        None => Ok(GuardPolicy::default()),
    }
}

async fn ask(
    data: &Path,
    table: &str,
    question: &str,
    policy: Option<PathBuf>,
    api_key: Option<String>,
    stub_sql: Option<String>,
) -> Result<()> {
    let store = Arc::new(load_store(data, table)?);
    let schema = store.describe_schema()?;
    let policy = load_policy(policy)?;
    let settings = LlmSettings::from_env()?.with_api_key(api_key);

    let generator: Arc<dyn CompletionService> = match stub_sql {
        Some(sql) => {
            info!("Using stub model output instead of the LLM");
            Arc::new(FixedCompletion::new(sql))
        }
        None => Arc::new(settings.client()?),
    };

    let pipeline = QueryPipeline::new(schema, &policy, generator, store)?
        .with_generation_timeout(settings.timeout);

    match pipeline.ask(question).await? {
        QueryOutcome::Answered { sql, table } => {
            println!("SQL: {}\n", sql);
            println!("{}", table);
        }
        QueryOutcome::Rejected { sql, reason } => {
            println!("SQL: {}\n", sql);
            println!("Rejected ({}): {}", reason.rule(), reason);
        }
    }
    Ok(())
}

fn check(data: &Path, table: &str, sql: &str, policy: Option<PathBuf>) -> Result<()> {
    let schema = load_store(data, table)?.describe_schema()?;
    let chain = ValidationChain::new(&load_policy(policy)?, &schema)?;

    match chain.validate(sql) {
        Verdict::Accepted => println!("Accepted"),
        Verdict::Rejected(reason) => println!("Rejected ({}): {}", reason.rule(), reason),
    }
    Ok(())
}

fn summary(data: &Path) -> Result<()> {
    let frame = ApplicantFrame::load(data)?;
    let summary = frame.summary()?;

    println!("Total applicants:            {}", summary.total_applicants);
    match summary.average_experience {
        Some(avg) => println!("Average experience:          {:.1} years", avg),
        None => println!("Average experience:          -"),
    }
    println!(
        "Most common education level: {}",
        summary.most_common_education.as_deref().unwrap_or("-")
    );

    println!("\nEducation breakdown:");
    for (category, count) in frame.education_breakdown()? {
        println!("  {:<12} {}", category, count);
    }
    Ok(())
}

fn filter(data: &Path, min: Option<f64>, max: Option<f64>, education: Vec<String>) -> Result<()> {
    let frame = ApplicantFrame::load(data)?;
    let mut selection = ApplicantFilter::reset(&frame)?;
    if let Some(min) = min {
        selection.min_experience = min;
    }
    if let Some(max) = max {
        selection.max_experience = max;
    }
    if !education.is_empty() {
        selection.education = education;
    }

    let filtered = frame.filter(&selection)?;
    let summary = filtered.summary()?;
    println!(
        "{} of {} applicants match (experience {}-{}, education: {})",
        summary.total_applicants,
        frame.height(),
        selection.min_experience,
        selection.max_experience,
        selection.education.join(", ")
    );
    println!("{}", filtered.frame());
    Ok(())
}
