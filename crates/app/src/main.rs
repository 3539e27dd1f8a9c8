use chrono::Utc;
use clap::{Parser, Subcommand};
use lease_lab_core::{
    mime_for_path, DocAiEngine, DocumentPipeline, ExtractionChain, ExtractionEngine, FsStore,
    JobStatus, OcrServiceEngine, PipelineLimits, SubmissionOutcome, VisionEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser)]
#[command(name = "lease-lab", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding job records and uploaded blobs.
    #[arg(long, default_value = "./lease-lab-data", env = "LEASE_LAB_DATA_DIR")]
    data_dir: PathBuf,

    /// Document-AI OCR endpoint (disabled when unset).
    #[arg(long, env = "LEASE_LAB_DOCAI_URL")]
    docai_url: Option<String>,

    #[arg(long, env = "LEASE_LAB_DOCAI_KEY", hide_env_values = true)]
    docai_key: Option<String>,

    /// Vision-model chat-completions endpoint (disabled when unset).
    #[arg(long, env = "LEASE_LAB_VISION_URL")]
    vision_url: Option<String>,

    #[arg(long, env = "LEASE_LAB_VISION_KEY", hide_env_values = true)]
    vision_key: Option<String>,

    #[arg(long, default_value = "gpt-4o", env = "LEASE_LAB_VISION_MODEL")]
    vision_model: String,

    /// Managed OCR service endpoint (disabled when unset).
    #[arg(long, env = "LEASE_LAB_OCR_URL")]
    ocr_url: Option<String>,

    #[arg(long, env = "LEASE_LAB_OCR_KEY", hide_env_values = true)]
    ocr_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Submit one document; small files are processed before returning.
    Submit {
        /// Path to the document (pdf, docx, txt, png, jpg).
        file: PathBuf,
        /// Extract a single page instead of running the full pipeline.
        #[arg(long)]
        page: Option<u32>,
        /// Queue the job even when it would qualify for the quick path.
        #[arg(long, default_value_t = false)]
        background: bool,
    },
    /// Submit every recognized document under a folder for background work.
    SubmitFolder { folder: PathBuf },
    /// Show the polling view of one job.
    Status { job_id: uuid::Uuid },
    /// Print the finished report for a READY job.
    Report {
        job_id: uuid::Uuid,
        /// Emit HTML instead of plain text.
        #[arg(long, default_value_t = false)]
        html: bool,
    },
    /// Cancel a pending job at the next stage boundary.
    Cancel { job_id: uuid::Uuid },
    /// Run pending jobs to completion; repeats when an interval is given.
    Worker {
        /// Poll interval in seconds; run once when omitted.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List all jobs.
    Jobs,
}

fn remote_engines(cli: &Cli) -> anyhow::Result<Vec<Arc<dyn ExtractionEngine>>> {
    let client = Arc::new(reqwest::Client::new());
    let mut engines: Vec<Arc<dyn ExtractionEngine>> = Vec::new();

    if let Some(url) = &cli.docai_url {
        engines.push(Arc::new(DocAiEngine::new(
            Arc::clone(&client),
            Url::parse(url)?,
            cli.docai_key.clone(),
        )));
    }
    if let Some(url) = &cli.vision_url {
        engines.push(Arc::new(VisionEngine::new(
            Arc::clone(&client),
            Url::parse(url)?,
            cli.vision_key.clone(),
            cli.vision_model.clone(),
        )));
    }
    if let Some(url) = &cli.ocr_url {
        engines.push(Arc::new(OcrServiceEngine::new(
            Arc::clone(&client),
            Url::parse(url)?,
            cli.ocr_key.clone(),
        )));
    }
    Ok(engines)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %cli.data_dir.display(),
        "lease-lab boot"
    );

    let limits = PipelineLimits::default();
    let store = Arc::new(FsStore::open(&cli.data_dir).await?);
    let chain = Arc::new(ExtractionChain::with_default_engines(
        remote_engines(&cli)?,
        limits.clone(),
    ));
    let pipeline = DocumentPipeline::new(Arc::clone(&store), store, chain, limits)?;

    match cli.command {
        Command::Submit {
            file,
            page,
            background,
        } => {
            let Some(mime_type) = mime_for_path(&file) else {
                anyhow::bail!("unrecognized file extension: {}", file.display());
            };
            let bytes = tokio::fs::read(&file).await?;
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("document");

            match pipeline
                .submit(filename, &bytes, mime_type, page, background)
                .await?
            {
                SubmissionOutcome::Quick { job } => {
                    println!("job {} finished: {}", job.id, job.status);
                    if let Some(summarise) = &job.summarise {
                        println!("{}", summarise.rendered_text);
                    } else if let Some(message) = &job.error_message {
                        println!("error: {message}");
                    }
                }
                SubmissionOutcome::Background {
                    job_id,
                    message,
                    alternatives,
                } => {
                    println!("job {job_id} queued: {message}");
                    for alternative in alternatives {
                        println!("  - {alternative}");
                    }
                }
                SubmissionOutcome::SinglePage { page, engine, text } => {
                    println!("page {page} (via {engine}):\n{text}");
                }
            }
        }
        Command::SubmitFolder { folder } => {
            let outcome = pipeline.submit_folder(&folder).await?;
            for skipped in &outcome.skipped {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
            }
            println!(
                "{} submitted, {} skipped; run the worker to process them",
                outcome.submitted.len(),
                outcome.skipped.len()
            );
            for id in outcome.submitted {
                println!("  {id}");
            }
        }
        Command::Status { job_id } => {
            let view = pipeline.status(job_id).await?;
            println!("job {} is {}", view.id, view.status);
            println!("  created: {}", view.created_at.to_rfc3339());
            println!("  updated: {}", view.updated_at.to_rfc3339());
            if let Some(stage) = view.failed_stage {
                println!("  failed stage: {stage}");
            }
            if let Some(message) = view.error_message {
                println!("  error: {message}");
            }
            if view.report.is_some() {
                println!("  report is ready, fetch it with the report command");
            }
        }
        Command::Report { job_id, html } => {
            let rendered = pipeline.rerender(job_id).await?;
            if html {
                println!("{}", rendered.rendered_html);
            } else {
                println!("{}", rendered.rendered_text);
            }
        }
        Command::Cancel { job_id } => {
            let job = pipeline.cancel(job_id).await?;
            println!("job {} is {}", job.id, job.status);
        }
        Command::Worker { interval } => loop {
            let finished = pipeline.run_pending().await?;
            for job in &finished {
                match job.status {
                    JobStatus::Ready => info!(id = %job.id, "job ready"),
                    status => warn!(id = %job.id, %status, "job did not finish cleanly"),
                }
            }
            if !finished.is_empty() {
                println!("{} job(s) processed at {}", finished.len(), Utc::now().to_rfc3339());
            }
            match interval {
                Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
                None => break,
            }
        },
        Command::Jobs => {
            for job in pipeline.list().await? {
                println!(
                    "{}  {:<9}  {:>8}B  {}",
                    job.id,
                    job.status.to_string(),
                    job.size_bytes,
                    job.filename
                );
            }
        }
    }

    Ok(())
}
