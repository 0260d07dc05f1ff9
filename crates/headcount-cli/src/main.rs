use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use headcount_attendance::{
    Clock, NewStudent, Reconciler, RecordStore, SqliteStore, StudentRecord, SystemClock,
};
use headcount_core::{
    DescriptorRegistry, DistancePolicy, EuclideanMatcher, FaceDescriptor, MatchResult, Matcher,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

mod config;
mod roster;
mod station;

use config::Config;
use roster::RosterWatch;
use station::{DuplicateWindow, Station};

#[derive(Parser)]
#[command(name = "headcount", about = "Face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll or update a student's face
    Enroll {
        /// Student number
        #[arg(short, long)]
        code: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Face descriptor as a JSON number array
        #[arg(short, long)]
        descriptor: String,
        /// Enroll even if the face already matches another student
        #[arg(long)]
        force: bool,
    },
    /// Upsert students from a JSON roster file
    Import {
        /// Array of {"code", "name", "descriptor"?} objects
        path: PathBuf,
    },
    /// List enrolled students
    Students,
    /// Deactivate a student (history is kept)
    Remove {
        /// Student number
        code: String,
    },
    /// Match one descriptor without recording attendance
    Identify {
        /// Face descriptor as a JSON number array
        descriptor: String,
    },
    /// Run the recognition station on JSON frames read from stdin
    Station,
    /// Show today's attendance
    Today,
    /// Show one student's attendance history
    History {
        /// Student number
        code: String,
    },
    /// Show attendance between two dates (inclusive, YYYY-MM-DD)
    Range { from: NaiveDate, to: NaiveDate },
}

#[derive(Deserialize)]
struct RosterRow {
    code: String,
    name: String,
    #[serde(default)]
    descriptor: Option<FaceDescriptor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    match cli.command {
        Commands::Enroll {
            code,
            name,
            descriptor,
            force,
        } => enroll(&config, &store, code, name, &descriptor, force).await?,
        Commands::Import { path } => import(&store, &path).await?,
        Commands::Students => {
            for s in store.all_students().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    s.code,
                    s.display_name,
                    if s.has_face() { "face" } else { "no face" },
                    if s.active { "active" } else { "inactive" },
                );
            }
        }
        Commands::Remove { code } => {
            if store.deactivate_student(&code).await? {
                println!("Deactivated {code}");
            } else {
                anyhow::bail!("no student with code {code}");
            }
        }
        Commands::Identify { descriptor } => {
            let query = FaceDescriptor::from_json(&descriptor).context("parsing descriptor")?;
            let registry = load_registry(&store).await?;
            let result = EuclideanMatcher::new(DistancePolicy::live()).compare(
                &query,
                &registry.snapshot(),
                config.confidence_threshold,
            )?;
            match result {
                MatchResult::Matched {
                    display_name,
                    confidence,
                    distance,
                    ..
                } => println!(
                    "{display_name} (confidence {:.1}%, distance {distance:.4})",
                    confidence * 100.0
                ),
                MatchResult::Unmatched { .. } => println!("Unknown"),
            }
        }
        Commands::Station => run_station(&config, store).await?,
        Commands::Today => {
            let today = SystemClock.now().date();
            print_json(&store.events_on(today).await?)?;
        }
        Commands::History { code } => {
            let student = find_student(&store, &code).await?;
            print_json(&store.student_history(student.id).await?)?;
        }
        Commands::Range { from, to } => {
            if from > to {
                anyhow::bail!("range start {from} is after end {to}");
            }
            print_json(&store.events_between(from, to).await?)?;
        }
    }

    Ok(())
}

async fn load_registry(store: &SqliteStore) -> Result<DescriptorRegistry> {
    let registry = DescriptorRegistry::new();
    roster::load_into(store, &registry).await?;
    Ok(registry)
}

async fn find_student(store: &SqliteStore, code: &str) -> Result<StudentRecord> {
    store
        .student_by_code(code)
        .await?
        .with_context(|| format!("no student with code {code}"))
}

/// Compare the new face against the roster with the enrollment policy
/// before saving it.
async fn enroll(
    config: &Config,
    store: &SqliteStore,
    code: String,
    name: String,
    descriptor: &str,
    force: bool,
) -> Result<()> {
    let descriptor = FaceDescriptor::from_json(descriptor).context("parsing descriptor")?;
    let registry = load_registry(store).await?;
    let snapshot = registry.snapshot();
    let existing = store.student_by_code(&code).await?;

    if let Some(previous) = existing.as_ref().and_then(|s| snapshot.get(s.id)) {
        match previous.descriptor.euclidean_distance(&descriptor) {
            Ok(distance) => tracing::info!(code = %code, distance, "replacing enrolled face"),
            Err(err) => {
                tracing::warn!(code = %code, error = %err, "replacing face from another model")
            }
        }
    }

    let matcher = EuclideanMatcher::new(DistancePolicy::Scaled {
        max_distance: config.max_distance,
    });
    let result = matcher.compare(&descriptor, &snapshot, config.confidence_threshold)?;

    if let MatchResult::Matched {
        student_id,
        display_name,
        confidence,
        ..
    } = &result
    {
        let same_student = existing.as_ref().is_some_and(|s| s.id == *student_id);
        if !same_student {
            if !force {
                anyhow::bail!(
                    "face already enrolled as {display_name} (confidence {:.1}%); use --force to enroll anyway",
                    confidence * 100.0
                );
            }
            tracing::warn!(
                code = %code,
                other = %display_name,
                confidence,
                "enrolling face that matches another student"
            );
        }
    }

    let id = store
        .upsert_student(NewStudent {
            code: code.clone(),
            display_name: name,
            descriptor: Some(descriptor),
        })
        .await?;
    tracing::info!(code = %code, student = %id, "student enrolled");
    println!("Enrolled {code}");
    Ok(())
}

async fn import(store: &SqliteStore, path: &Path) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rows: Vec<RosterRow> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut imported = 0usize;
    for row in rows {
        store
            .upsert_student(NewStudent {
                code: row.code,
                display_name: row.name,
                descriptor: row.descriptor,
            })
            .await?;
        imported += 1;
    }

    println!("Imported {imported} students");
    Ok(())
}

async fn run_station(config: &Config, store: SqliteStore) -> Result<()> {
    let registry = Arc::new(DescriptorRegistry::new());
    let mut watch = RosterWatch::start(store.clone(), Arc::clone(&registry)).await?;
    if registry.size() == 0 {
        tracing::warn!("no enrolled faces; every frame will be reported as unknown");
    }

    let clock = Arc::new(SystemClock);
    let reconciler = Reconciler::with_clock(store, config.reconciler()?, clock.clone());
    let mut station = Station::new(
        registry,
        EuclideanMatcher::new(DistancePolicy::live()),
        config.confidence_threshold,
        reconciler,
        DuplicateWindow::new(config.duplicate_window()?),
        clock,
    );

    let session = uuid::Uuid::new_v4();
    async move {
        tracing::info!("station ready");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Err(err) = watch.refresh().await {
                tracing::warn!(error = %err, "roster check failed; keeping current registry");
            }
            let outcome = station.process(&line).await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        tracing::info!("station input closed");
        Ok::<_, anyhow::Error>(())
    }
    .instrument(tracing::info_span!("station", %session))
    .await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
