mod app;
mod capture;
mod config;
mod db;
mod error;
mod models;
mod report;
mod scheduler;
mod summary;
mod timelapse;

use clap::Parser;
use chrono::Utc;
use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use app::{App, ProcessingReport};
use config::Config;
use db::Database;
use models::Session;
use scheduler::StopToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Screen capture and timelapse recorder for tutoring sessions")]
struct Args {
    #[arg(long, help = "Start a capture session and record until Ctrl+C")]
    start: bool,

    #[arg(long, help = "Stop the active session and write its summary")]
    stop: bool,

    #[arg(long, help = "Summarize every completed session that has no summary yet")]
    analyze: bool,

    #[arg(long, help = "Show the active session, if any")]
    status: bool,

    #[arg(short, long, help = "List N recent completed sessions", value_name = "N")]
    list: Option<i64>,

    #[arg(long, help = "Student name for a new session, or list filter", value_name = "NAME")]
    student: Option<String>,

    #[arg(long, default_value_t = 30, help = "Seconds between screenshots", value_name = "SECS")]
    interval: u64,

    #[arg(long, help = "Export a session's metadata as JSON", value_name = "ID", requires = "output")]
    export: Option<i64>,

    #[arg(long, help = "Destination for --export", value_name = "PATH")]
    output: Option<PathBuf>,

    #[arg(long, help = "Path to the configuration file", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    init_logging();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_logging() {
    let filter = if env::var("TUTORCAP_DEBUG_LOG").map(|v| v == "1").unwrap_or(false) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.interval == 0 {
        return Err("--interval must be at least 1 second".into());
    }

    let config = Config::load(args.config.as_deref())?;

    if args.start {
        let app = App::new(config)?;
        return handle_start(&app, &args);
    }
    if args.stop {
        let app = App::new(config)?;
        return handle_stop(&app);
    }
    if args.analyze {
        let app = App::new(config)?;
        let reports = app.analyze_pending()?;
        if reports.is_empty() {
            println!("No sessions waiting for analysis");
        }
        for processed in &reports {
            print_report(processed);
        }
        return Ok(());
    }

    let db = Database::open(&config.data_dir)?;
    if let Some(id) = args.export {
        // clap enforces --output alongside --export
        let output = args.output.as_deref().ok_or("--export requires --output")?;
        db.export_session_data(id, output)?;
        println!("✓ Session {} exported to {}", id, output.display());
    } else if let Some(limit) = args.list {
        handle_list(&db, args.student.as_deref(), limit)?;
    } else {
        handle_status(&db)?;
        if !args.status {
            println!("Run with --help to see available commands");
        }
    }

    Ok(())
}

fn handle_start(app: &App, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let token = StopToken::new();
    {
        let token = token.clone();
        let _ = ctrlc::set_handler(move || {
            token.cancel();
        });
    }

    let student = args.student.as_deref().unwrap_or("");
    println!("Capturing every {}s, press Ctrl+C to finish", args.interval);
    let outcome = app.start_capture(Duration::from_secs(args.interval), student, token)?;
    println!(
        "Session {}: {} screenshots taken ({} failed)",
        outcome.session.id, outcome.stats.succeeded, outcome.stats.failed
    );

    if outcome.session.is_active() {
        let processed = app.stop_and_summarize(outcome.session.id)?;
        print_report(&processed);
    } else {
        println!("Session was stopped by another process");
    }
    Ok(())
}

fn handle_stop(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let session = app.store().get_active_session()?.ok_or(error::Error::NoActiveSession)?;
    let processed = app.stop_and_summarize(session.id)?;
    println!(
        "✓ Session {} stopped after {}",
        session.id,
        report::format_duration(session.duration(Utc::now()))
    );
    print_report(&processed);
    Ok(())
}

fn handle_status(db: &Database) -> Result<(), Box<dyn std::error::Error>> {
    match db.get_active_session()? {
        Some(session) => {
            let count = db.get_session_screenshots(session.id)?.len();
            println!(
                "Active session {} ({}) running for {}, {} screenshots",
                session.id,
                student_label(&session),
                report::format_duration(session.duration(Utc::now())),
                count
            );
        }
        None => println!("No active session"),
    }
    println!("Data directory: {}", db.base_dir().display());
    Ok(())
}

fn handle_list(db: &Database, student: Option<&str>, limit: i64) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = match student {
        Some(name) => db.list_completed_sessions_for_student(name, limit)?,
        None => db.list_completed_sessions(limit)?,
    };

    for session in sessions {
        println!(
            "{:>4}  {}  {:<16} {}",
            session.id,
            session.start_time.format("%Y-%m-%d %H:%M"),
            student_label(&session),
            report::format_duration(session.duration(Utc::now()))
        );
    }
    Ok(())
}

fn print_report(processed: &ProcessingReport) {
    println!(
        "Session {}: {} screenshots processed",
        processed.session_id, processed.screenshot_count
    );
    if let Some(path) = &processed.summary_path {
        println!("  summary:   {}", path.display());
    }
    if let Some(path) = &processed.timelapse_path {
        println!("  timelapse: {}", path.display());
    }
    for failure in &processed.failures {
        println!("  warning:   {}", failure);
    }
    if let Some(summary) = &processed.summary {
        println!("\n{}", summary);
    }
}

fn student_label(session: &Session) -> &str {
    if session.student_name.is_empty() {
        "-"
    } else {
        &session.student_name
    }
}
