use chrono::Duration as ChronoDuration;
use clap::{App, Arg};
use colored::*;
use observatory::devices::DeviceKind;
use observatory::sim::SimWorld;
use observatory::{load_tickets, ObservatoryConfig, RunEnding, RunOptions, RunReport, Scheduler};
use std::path::Path;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("observatory")
        .version("0.1.0")
        .author("Observatory Systems Engineering Team")
        .about("🔭 Autonomous observatory - rehearse a night of tickets against the simulated site")
        .arg(
            Arg::with_name("tickets")
                .help("Ticket file: one JSON ticket or a list of tickets")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Observatory configuration (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("images")
                .short("i")
                .long("images")
                .value_name("DIR")
                .help("Directory that receives the frames")
                .takes_value(true)
                .default_value("images"),
        )
        .arg(
            Arg::with_name("no-shutdown")
                .long("no-shutdown")
                .help("Leave the observatory open at the end of the plan"),
        )
        .arg(
            Arg::with_name("calibrate")
                .long("calibrate")
                .help("Take flats and darks at the configured calibration time"),
        )
        .arg(
            Arg::with_name("no-focus")
                .long("no-focus")
                .help("Skip all focusing"),
        )
        .arg(
            Arg::with_name("weather")
                .long("weather")
                .value_name("MINUTES")
                .help("Raise a weather alert for this long after the first ticket starts")
                .takes_value(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Weather alert length must be whole minutes".into()),
                }),
        )
        .get_matches();

    let tickets = load_tickets(Path::new(matches.value_of("tickets").unwrap_or_default()))?;
    let config = match matches.value_of("config") {
        Some(path) => ObservatoryConfig::load(Path::new(path))?,
        None => ObservatoryConfig::default(),
    };
    let mut options = RunOptions::new(matches.value_of("images").unwrap_or("images"));
    options.shutdown_toggle = !matches.is_present("no-shutdown");
    options.calibration_toggle = matches.is_present("calibrate");
    options.focus_toggle = !matches.is_present("no-focus");

    let Some(first_start) = tickets.iter().map(|t| t.start_utc()).min() else {
        println!("{}", "No tickets to observe".yellow());
        return Ok(());
    };
    let world = SimWorld::new(first_start - ChronoDuration::minutes(1));
    if let Some(minutes) = matches.value_of("weather").and_then(|m| m.parse::<i64>().ok()) {
        world
            .conditions
            .add_alert(first_start, first_start + ChronoDuration::minutes(minutes));
    }

    println!("{}", "🔭 Observatory rehearsal".bold().cyan());
    println!("  Tickets: {}", tickets.len().to_string().bright_white());
    println!("  Images:  {}", options.image_dir.display().to_string().bright_white());

    let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
    let env = world.environment();
    let run = tokio::task::spawn_blocking(move || {
        let mut scheduler = Scheduler::new(tickets, config, options, env)?;
        let _ = handle_tx.send(scheduler.shutdown_handle());
        scheduler.observe()
    });

    if let Ok(shutdown) = handle_rx.recv() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; requesting shutdown");
                shutdown.request();
            }
        });
    }

    match run.await? {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            println!("{} {}", "✗".red().bold(), e.to_string().red());
            Err(e.into())
        }
    }
}

fn print_report(report: &RunReport) {
    let ending = match report.ending {
        RunEnding::Completed => "completed".green(),
        RunEnding::WeatherWindowClosed => "weather window closed".yellow(),
        RunEnding::ShutdownRequested => "shutdown requested".yellow(),
        RunEnding::Aborted => "aborted".red(),
    };
    println!("\n{} Run {}", "📋".bold(), ending.bold());

    for ticket in &report.tickets {
        let counts = format!("{}/{}", ticket.taken, ticket.total);
        let counts = if ticket.taken == ticket.total {
            counts.green()
        } else if ticket.taken == 0 {
            counts.red()
        } else {
            counts.yellow()
        };
        println!("  {:<24} {}", ticket.name.bright_white(), counts);
    }

    if report.restarts.total() > 0 {
        println!("\n{}", "🔄 Restarts".bold());
        for kind in DeviceKind::ALL {
            let count = report.restarts.count(kind);
            if count > 0 {
                println!("  {:<16} {}", kind.to_string(), count.to_string().yellow());
            }
        }
    }
    if report.critical_shutdowns > 0 {
        println!(
            "\n{} {}",
            "🚨 Critical shutdowns:".red().bold(),
            report.critical_shutdowns
        );
    }
}
