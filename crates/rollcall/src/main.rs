use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{codec, ClassId, Embedding, StudentId, SubjectId, TeacherId};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod report;
mod script;
mod service;
mod session;
mod store;

use config::Config;
use script::{FrameScript, ScriptedCamera, ScriptedExtractor, ScriptedLandmarker};
use service::{AttendanceService, ServiceError};
use store::AttendanceStore;

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Classroom attendance from blink-verified face matches", long_about = None)]
struct Cli {
    /// SQLite database path (overrides ROLLCALL_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Enroll a student into a class
    EnrollStudent {
        #[arg(long)]
        id: StudentId,
        #[arg(long)]
        class: ClassId,
        #[arg(long)]
        name: String,
        /// Embedding file: an encoded blob or a JSON array of numbers
        #[arg(long)]
        embedding: Option<PathBuf>,
    },
    /// Enroll a teacher
    EnrollTeacher {
        #[arg(long)]
        id: TeacherId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        embedding: Option<PathBuf>,
    },
    /// Let a teacher run a subject for a class
    Assign {
        #[arg(long)]
        teacher: TeacherId,
        #[arg(long)]
        subject: SubjectId,
        #[arg(long)]
        class: ClassId,
    },
    /// List the (class, subject) pairs a teacher may run
    Assignments {
        #[arg(long)]
        teacher: TeacherId,
    },
    /// Run one attendance session over a frame script
    Run {
        #[arg(long)]
        teacher: TeacherId,
        #[arg(long)]
        class: ClassId,
        #[arg(long)]
        subject: SubjectId,
        #[arg(long)]
        script: PathBuf,
        /// Attendance date (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Identify a teacher from a frame script
    Identify {
        #[arg(long)]
        script: PathBuf,
    },
    /// Print the attendance report as JSON
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Export the attendance report as CSV
    ExportCsv {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Output file (defaults to stdout)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.validate().context("invalid configuration")?;

    let store = AttendanceStore::open(&config.db_path, config.embedding_secret.as_deref())
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    match cli.command {
        Commands::InitDb => {
            println!("Schema ready at {}.", config.db_path.display());
        }
        Commands::EnrollStudent {
            id,
            class,
            name,
            embedding,
        } => {
            let embedding = embedding.as_deref().map(read_embedding).transpose()?;
            store
                .enroll_student(id, class, &name, embedding.as_ref())
                .await?;
            println!("Enrolled student {id} ({name}) in class {class}.");
        }
        Commands::EnrollTeacher { id, name, embedding } => {
            let embedding = embedding.as_deref().map(read_embedding).transpose()?;
            store.enroll_teacher(id, &name, embedding.as_ref()).await?;
            println!("Enrolled teacher {id} ({name}).");
        }
        Commands::Assign {
            teacher,
            subject,
            class,
        } => {
            store.assign_subject(teacher, subject, class).await?;
            println!("Teacher {teacher} now teaches subject {subject} to class {class}.");
        }
        Commands::Assignments { teacher } => {
            let assignments = store.list_assignments(teacher).await?;
            if assignments.is_empty() {
                println!("Teacher {teacher} has no assignments.");
            }
            for a in &assignments {
                println!("class {} subject {}", a.class_id, a.subject_id);
            }
        }
        Commands::Run {
            teacher,
            class,
            subject,
            script,
            date,
        } => {
            let frames = FrameScript::load(&script)?;
            if frames.is_empty() {
                tracing::warn!(script = %script.display(), "frame script has no frames");
            }
            tracing::info!(frames = frames.len(), "frame script loaded");
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let service = AttendanceService::new(config, Arc::new(store))?;

            service.start_session(teacher, class, subject).await?;
            let detection = service
                .run_detection(
                    teacher,
                    class,
                    ScriptedCamera::new(frames),
                    ScriptedLandmarker,
                    ScriptedExtractor,
                )
                .await;
            let summary = match detection {
                Ok(summary) => summary,
                Err(e) => {
                    service.shutdown();
                    return Err(e).context("detection run failed");
                }
            };
            let records = match service.end_session(teacher, class, date).await {
                Ok(records) => records,
                Err(ServiceError::Persist { records, source }) => {
                    tracing::warn!(error = %source, "retrying attendance write once");
                    if let Err(e) = service.save_records(&records).await {
                        // Keep the scored session recoverable from stdout.
                        println!("{}", serde_json::to_string_pretty(&records)?);
                        return Err(e).context("attendance records could not be saved");
                    }
                    records
                }
                Err(e) => return Err(e.into()),
            };

            let out = serde_json::json!({ "detection": summary, "records": records });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Identify { script } => {
            let frames = FrameScript::load(&script)?;
            let service = AttendanceService::new(config, Arc::new(store))?;
            match service
                .identify_teacher(
                    ScriptedCamera::new(frames),
                    ScriptedLandmarker,
                    ScriptedExtractor,
                )
                .await?
            {
                Some((teacher_id, distance)) => {
                    println!("Identified teacher {teacher_id} (distance {distance:.3}).")
                }
                None => bail!("no enrolled teacher recognised"),
            }
        }
        Commands::Report { date } => {
            let rows = store.attendance_report(date).await?;
            println!("{}", report::to_json(&rows)?);
        }
        Commands::ExportCsv { date, out } => {
            let rows = store.attendance_report(date).await?;
            let written = match &out {
                Some(path) => {
                    let file = std::fs::File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    report::write_csv(&rows, file)?
                }
                None => report::write_csv(&rows, std::io::stdout().lock())?,
            };
            if let Some(path) = out {
                eprintln!("Exported {written} rows to {}.", path.display());
            }
        }
    }

    Ok(())
}

/// Read an embedding from an encoded blob or a JSON array of numbers.
fn read_embedding(path: &Path) -> Result<Embedding> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.starts_with(&codec::MAGIC) {
        return codec::decode(&bytes)
            .with_context(|| format!("invalid embedding blob {}", path.display()));
    }
    let values: Vec<f32> = serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is neither an embedding blob nor a JSON array", path.display()))?;
    let embedding = Embedding::new(values);
    if embedding.dim() == 0 || !embedding.is_finite() {
        bail!("embedding in {} must be non-empty and finite", path.display());
    }
    Ok(embedding)
}
