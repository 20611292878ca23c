//! mergezero command-line front end
//!
//! ```text
//! mergezero placeholders <template.docx>
//! mergezero validate <template.docx> <data.xlsx>
//! mergezero generate <template.docx> <data.xlsx> [--pattern <pattern>] [--format <ext>]...
//! ```
//!
//! Settings are read from the environment (and a `.env` file), see `PipelineBuilder::from_env`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mergezero::{extract_placeholders, GenerateRequest, MergeZeroError, Pipeline, PipelineBuilder};
use tracing::error;

#[derive(Parser)]
#[command(name = "mergezero")]
#[command(about = "Merge spreadsheet rows into DOCX templates")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the placeholders of a template as JSON
    Placeholders {
        /// DOCX template
        template: PathBuf,
    },
    /// Compare template placeholders with dataset headers
    Validate {
        /// DOCX template
        template: PathBuf,
        /// XLSX/XLS/ODS dataset
        dataset: PathBuf,
    },
    /// Generate one document per row and package them into an archive
    Generate {
        /// DOCX template
        template: PathBuf,
        /// XLSX/XLS/ODS dataset
        dataset: PathBuf,
        /// File name pattern, e.g. "{index}-{Name}"
        #[arg(long)]
        pattern: Option<String>,
        /// Additional output format (repeatable)
        #[arg(long = "format", value_name = "EXT")]
        formats: Vec<String>,
    },
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// テンプレートとデータセットを新しいセッションに登録する
fn open_session(
    pipeline: &Pipeline,
    template: &Path,
    dataset: &Path,
) -> Result<String, MergeZeroError> {
    let session = pipeline.new_session();
    pipeline.upload_template(&session, &file_name(template), &std::fs::read(template)?)?;
    pipeline.upload_dataset(&session, &file_name(dataset), &std::fs::read(dataset)?)?;
    Ok(session)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), MergeZeroError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| MergeZeroError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    println!("{}", json);
    Ok(())
}

fn run(command: Commands) -> Result<(), MergeZeroError> {
    match command {
        Commands::Placeholders { template } => {
            let placeholders = extract_placeholders(&std::fs::read(template)?)?;
            print_json(&placeholders)
        }
        Commands::Validate { template, dataset } => {
            let pipeline = PipelineBuilder::from_env()?.build()?;
            let session = open_session(&pipeline, &template, &dataset)?;
            print_json(&pipeline.validate(&session)?)
        }
        Commands::Generate {
            template,
            dataset,
            pattern,
            formats,
        } => {
            let mut request = GenerateRequest::new().with_formats(formats);
            if let Some(pattern) = pattern {
                request = request.with_file_name_pattern(pattern);
            }
            let pipeline = PipelineBuilder::from_env()?.build()?;
            let session = open_session(&pipeline, &template, &dataset)?;
            print_json(&pipeline.generate(&session, &request)?)
        }
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(MergeZeroError::RowsFailed { errors }) => {
            for message in &errors {
                error!("{}", message);
            }
            eprintln!("error: {} rows failed", errors.len());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
