// src/main.rs
use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, Subcommand};
use std::{fs::File, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flock_core::backend_client::BackendClient;
use flock_core::bulk_import::parse_members_csv;
use flock_core::calendar::{format_calendar_date, parse_calendar_date, Clock};
use flock_core::config::Config;
use flock_core::handlers::{router, AppState};
use flock_core::models::Actor;
use flock_core::snapshot::SnapshotStore;
use flock_core::sync::{spawn_snapshot_writer, Synchronizer};
use flock_core::{is_current_week, sundays_for_year, AttendanceBook, Sunday, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "flock", version, about = "Weekly church attendance service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Import members from a CSV file into the local snapshot
    Import {
        #[arg(long)]
        file: PathBuf,
        /// Department for rows without a department column
        #[arg(long)]
        department: Option<String>,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Print the attendance week containing a date (today by default)
    Week {
        #[arg(long)]
        date: Option<String>,
    },
    /// List every Sunday of a year
    Sundays {
        #[arg(long)]
        year: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(Config::from_env()?).await,
        Command::Import {
            file,
            department,
            user,
        } => import(Config::from_env()?, file, department, user),
        Command::Week { date } => print_week(date),
        Command::Sundays { year } => print_sundays(year),
    }
}

fn load_book(config: &Config) -> Result<(AttendanceBook, SnapshotStore)> {
    let book = AttendanceBook::new(Arc::new(SystemClock), config.aliases());
    let store = SnapshotStore::new(config.snapshot_path.clone());
    book.restore(store.load().context("Loading attendance snapshot failed")?);
    Ok((book, store))
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting flock attendance server");
    let (book, store) = load_book(&config)?;

    spawn_snapshot_writer(book.clone(), store.clone());

    let backend_configured = match config.backend() {
        Some((url, api_key)) => {
            let client = BackendClient::new(url, api_key).context("Creating backend client failed")?;
            let synchronizer =
                Synchronizer::new(book.clone(), Arc::new(client)).with_snapshot_store(store.clone());

            info!("Performing initial backend synchronization...");
            if let Err(e) = synchronizer.sync_all().await {
                error!("Initial backend sync failed, serving from snapshot: {}", e);
            }
            synchronizer.spawn_change_forwarder();
            tokio::spawn(
                synchronizer.run_periodic(Duration::from_secs(config.sync_interval_secs)),
            );
            true
        }
        None => {
            warn!("No backend configured; the local snapshot is the only copy");
            false
        }
    };

    let app = router(AppState::new(book, backend_configured));
    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_addr()))?;

    match config.tls_paths() {
        Some((cert_path, key_path)) => {
            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .context("Failed to load TLS cert/key")?;
            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
                .context("HTTPS server failed")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Binding {} failed", addr))?;
            info!("Listening on http://{}", addr);
            axum::serve(listener, app).await.context("HTTP server failed")?;
        }
    }
    Ok(())
}

fn import(config: Config, file: PathBuf, department: Option<String>, user: String) -> Result<()> {
    let (book, store) = load_book(&config)?;
    if config.backend().is_some() {
        // Queued in the snapshot; the next `serve` pushes them.
        book.track_unpushed_changes();
    }
    let reader = File::open(&file).with_context(|| format!("Opening {:?} failed", file))?;
    let parsed = parse_members_csv(reader, department.as_deref(), book.aliases())?;

    for problem in &parsed.problems {
        println!("  line {}: {}", problem.line, problem.message);
    }
    let summary = book.import_members(&Actor::admin(&user), parsed.members)?;
    store.save(&book.snapshot())?;

    println!(
        "Imported {} members ({} already present, {} rows rejected) into {:?}",
        summary.created,
        summary.skipped,
        parsed.problems.len(),
        store.path()
    );
    Ok(())
}

fn print_week(date: Option<String>) -> Result<()> {
    let clock = SystemClock;
    let date = match date {
        Some(raw) => parse_calendar_date(&raw)?,
        None => clock.today(),
    };
    let sunday = Sunday::containing(date);
    let marker = if is_current_week(sunday, &clock) {
        " (current week)"
    } else {
        ""
    };
    println!("Week of {}{}", sunday, marker);
    for day in sunday.week_dates() {
        println!("  {} {}", format_calendar_date(day), day.format("%a"));
    }
    println!("Previous: {}  Next: {}", sunday.previous(), sunday.next());
    Ok(())
}

fn print_sundays(year: i32) -> Result<()> {
    let sundays = sundays_for_year(year);
    if sundays.is_empty() {
        anyhow::bail!("Year {} is outside the supported calendar range", year);
    }
    for (index, sunday) in sundays.iter().enumerate() {
        println!("{:>2}. {}", index + 1, sunday);
    }
    println!("{} Sundays in {}", sundays.len(), year);
    Ok(())
}
