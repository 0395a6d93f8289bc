use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use labflow_core::config::{
    load_normalization_tables, schema_version_from_env_value, text_layer_policy_from_env_values,
};
use labflow_core::{
    Clock, CoreConfig, CorrectionOutcome, ErrorCode, InMemoryStore, ReportPipeline, ReportStatus,
    SchemaValidator, SystemClock, Upload, UploadOutcome, ValidationOutcome, ids,
};

#[derive(Parser)]
#[command(name = "labflow")]
#[command(about = "Deterministic lab report processing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the SHA-256 dedup key of a file
    Hash {
        /// File to hash
        file: PathBuf,
    },
    /// Validate an extraction payload and print it normalized, or its field errors
    Validate {
        /// JSON payload file
        payload: PathBuf,
    },
    /// Print every report status with its metadata
    Statuses,
    /// Run one report through the pipeline and write its bundle
    Run {
        /// Subject identifier the report belongs to
        #[arg(long)]
        subject: String,
        /// Original report file (the dedup key is its hash)
        #[arg(long)]
        file: PathBuf,
        /// Extraction payload (JSON)
        #[arg(long)]
        payload: PathBuf,
        /// Extracted text layer; a sparse one fails the report as a scanned document
        #[arg(long)]
        text: Option<PathBuf>,
        /// Full corrected payload (JSON) to apply before generating the bundle
        #[arg(long)]
        correction: Option<PathBuf>,
        /// Editor recorded in the edit history
        #[arg(long, default_value = "cli")]
        editor: String,
        /// Where to write the bundle (stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Regenerate from the source version and check the content is identical
        #[arg(long)]
        verify_regeneration: bool,
    },
}

/// Entry point for the labflow CLI.
///
/// # Environment Variables
/// - `LABFLOW_SCHEMA_VERSION`: supported payload schema version (default: "1.0")
/// - `LABFLOW_NORMALIZATION_FILE`: YAML file extending the built-in alias and unit tables
/// - `LABFLOW_MIN_TEXT_CHARS` / `LABFLOW_MIN_TEXT_WORDS`: scanned-document thresholds
/// - `RUST_LOG`: log filter (`labflow` and `labflow_core` log at info by default)
fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("labflow=info".parse()?)
                .add_directive("labflow_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Hash { file }) => {
            let bytes = std::fs::read(&file)?;
            println!("{}", ids::file_hash(&bytes).to_hex());
        }
        Some(Commands::Validate { payload }) => {
            let cfg = core_config()?;
            let raw = read_json(&payload)?;
            match SchemaValidator::new(cfg.clone()).validate(&raw, SystemClock.now()) {
                ValidationOutcome::Valid(payload) => {
                    let normalized = cfg.tables().normalize(&payload);
                    println!("{}", serde_json::to_string_pretty(&normalized.payload)?);
                }
                ValidationOutcome::Invalid(errors) => {
                    for error in &errors {
                        eprintln!("{error}");
                    }
                    anyhow::bail!("payload has {} validation error(s)", errors.len());
                }
            }
        }
        Some(Commands::Statuses) => {
            let metadata: Vec<_> = ReportStatus::ALL.iter().map(|s| s.metadata()).collect();
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Some(Commands::Run {
            subject,
            file,
            payload,
            text,
            correction,
            editor,
            out,
            verify_regeneration,
        }) => {
            let cfg = core_config()?;
            let pipeline = ReportPipeline::new(cfg.clone(), InMemoryStore::new());

            let bytes = std::fs::read(&file)?;
            let upload = Upload {
                subject_id: subject,
                original_filename: file_name(&file),
                content_type: content_type_for(&file).to_string(),
                storage_locator: Some(format!("file://{}", file.display())),
                declared_hash: None,
            };
            let report = match pipeline.register_upload(upload, &bytes)? {
                UploadOutcome::Registered(report) => report,
                UploadOutcome::Duplicate { original_id, .. } => {
                    tracing::info!("++ Duplicate of report {}", original_id);
                    return Ok(());
                }
            };
            pipeline.start_parsing(report.id)?;

            if let Some(text) = text {
                let text = std::fs::read_to_string(&text)?;
                if cfg.text_layer_policy().looks_scanned(&text) {
                    let failed = pipeline
                        .record_extraction_failure(report.id, "text layer too sparse; scanned document")?;
                    anyhow::bail!("report {} is {}", failed.id, failed.status);
                }
            }

            let version = pipeline.record_extraction(report.id, &read_json(&payload)?, "cli")?;
            for error in version.validation_errors() {
                tracing::warn!("Extraction error: {}", error);
            }

            if let Some(correction) = correction {
                pipeline.begin_editing(report.id)?;
                match pipeline.submit_correction(report.id, &read_json(&correction)?, &editor)? {
                    CorrectionOutcome::Applied { version, entries } => {
                        tracing::info!(
                            "++ Applied correction as version {} ({} field(s) changed)",
                            version.version_number,
                            entries.len()
                        );
                    }
                    CorrectionOutcome::Rejected(errors) => {
                        for error in &errors {
                            tracing::warn!("Correction error: {}", error);
                        }
                        pipeline.cancel_editing(report.id)?;
                        tracing::info!(
                            "++ Correction rejected; keeping version {}",
                            version.version_number
                        );
                    }
                    CorrectionOutcome::Unchanged => {
                        pipeline.cancel_editing(report.id)?;
                        tracing::info!("++ Correction changes nothing");
                    }
                }
            }

            let artifact = match pipeline.generate_bundle(report.id) {
                Ok(artifact) => artifact,
                Err(e) => {
                    let report = pipeline.report(report.id)?;
                    let code = report
                        .failure
                        .map(|f| f.error_code)
                        .unwrap_or(ErrorCode::ProcessingError);
                    anyhow::bail!("bundle generation failed ({code}): {e}");
                }
            };

            if verify_regeneration {
                let again = pipeline.regenerate_bundle(report.id, artifact.source_version_id)?;
                if again.content_hash != artifact.content_hash {
                    anyhow::bail!("regenerated bundle differs from the original");
                }
                tracing::info!("++ Regeneration reproduced the bundle");
            }

            let bundle = fhir::LabBundle::parse(&artifact.bundle_content)?;
            tracing::info!(
                "++ Report {} completed: {} observation(s), content hash {}",
                report.id,
                bundle.observations.len(),
                artifact.content_hash.to_hex()
            );
            match out {
                Some(path) => std::fs::write(&path, &artifact.bundle_content)?,
                None => println!("{}", artifact.bundle_content),
            }
        }
        None => {
            println!("Use 'labflow --help' for commands");
        }
    }

    Ok(())
}

/// Core configuration resolved once from the environment.
fn core_config() -> anyhow::Result<Arc<CoreConfig>> {
    let env = |name: &str| std::env::var(name).ok();

    let tables = load_normalization_tables(env("LABFLOW_NORMALIZATION_FILE").map(PathBuf::from))?;
    let text_layer_policy =
        text_layer_policy_from_env_values(env("LABFLOW_MIN_TEXT_CHARS"), env("LABFLOW_MIN_TEXT_WORDS"))?;
    let cfg = CoreConfig::new(
        schema_version_from_env_value(env("LABFLOW_SCHEMA_VERSION")),
        tables,
        text_layer_policy,
    )?;
    Ok(Arc::new(cfg))
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("pdf") => "application/pdf",
        Some(ext) if ext.eq_ignore_ascii_case("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
