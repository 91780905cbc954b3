//! Download TROPOMI - Methane Inversion Data Pipeline
//!
//! Generates and runs a shell script of `aws s3 sync` commands that mirror
//! TROPOMI methane (L2__CH4___) granules from the public meeo-s5p bucket
//! into a local data directory for a simulation period.
//!
//! Key behaviors:
//! - Iterates the period one calendar day at a time (end date exclusive)
//! - Reprocessed granules (RPRO) cover 2018-04-30 to 2018-11-27, offline
//!   granules (OFFL) cover 2018-11-29 onward, both exist on 2018-11-28
//! - Days before 2018-04-30 have no data and are skipped
//! - The generated script is removed again after it has run
//!
//! Exit codes:
//! - 0: Sync script ran successfully
//! - 1: No TROPOMI data in the requested period
//! - 2: Error occurred

use chrono::{Duration, NaiveDate};
use clap::Parser;
use serde::Deserialize;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::ExitStatus;
use tokio::{fs, process::Command};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const REMOTE_ROOT: &str = "s3://meeo-s5p";
const PRODUCT: &str = "L2__CH4___";
const DEFAULT_SCRIPT_PATH: &str = "./auto_generated_download_script.sh";

#[derive(Parser, Debug)]
#[command(name = "download_tropomi")]
#[command(about = "Mirror TROPOMI CH4 granules from the meeo-s5p bucket for a simulation period")]
struct Args {
    /// Start date of the download period (YYYYMMDD, inclusive)
    #[arg(required_unless_present = "config")]
    start_date: Option<String>,

    /// End date of the download period (YYYYMMDD, exclusive)
    #[arg(required_unless_present = "config")]
    end_date: Option<String>,

    /// Directory the granules are mirrored into
    #[arg(required_unless_present = "config")]
    data_dir: Option<String>,

    /// Read the download period from a JSON config file instead of the
    /// positional arguments (dates as YYYY-MM-DD, end date exclusive)
    #[arg(long, conflicts_with_all = ["start_date", "end_date", "data_dir"])]
    config: Option<String>,

    /// Where to write the generated sync script
    #[arg(long, default_value = DEFAULT_SCRIPT_PATH)]
    script_path: String,

    /// Print the generated script instead of running it
    #[arg(long)]
    dry_run: bool,

    /// Keep the generated script after it has run
    #[arg(long)]
    keep_script: bool,

    /// Request anonymous access by appending --no-sign-request to every
    /// sync command
    #[arg(long)]
    no_sign_request: bool,
}

#[derive(Deserialize, Debug)]
struct Config {
    start_date: NaiveDate,
    end_date: NaiveDate,
    data_dir: String,
}

/// TROPOMI processing stream a granule directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Reprocessed,
    Offline,
}

impl Collection {
    fn key(self) -> &'static str {
        match self {
            Collection::Reprocessed => "RPRO",
            Collection::Offline => "OFFL",
        }
    }
}

#[derive(Debug, Default)]
struct DownloadStats {
    days_in_period: u32,
    days_without_data: u32,
    reprocessed_commands: u32,
    offline_commands: u32,
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(synced) => {
            if synced {
                0 // Sync script ran (or dry run printed)
            } else {
                1 // Nothing to download
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            2 // Error
        }
    };

    std::process::exit(exit_code);
}

async fn run() -> Result<bool> {
    let args = Args::parse();

    let (start_date, end_date, data_dir) = resolve_period(&args).await?;

    println!("=== TROPOMI download ===");

    // The end date names the end of the simulation period, so the last day
    // actually fetched is the day before it.
    let last_day = end_date - Duration::days(1);
    if last_day < start_date {
        println!(
            "• Empty download period: end date {} is on or before start date {}.",
            end_date, start_date
        );
        return Ok(false);
    }

    let (commands, stats) =
        build_sync_commands(start_date, last_day, &data_dir, args.no_sign_request);

    println!(
        "Period: {} -> {} ({} day(s))",
        start_date, last_day, stats.days_in_period
    );
    println!("Data directory: {}", data_dir);

    if stats.days_without_data > 0 {
        println!(
            "Skipping {} day(s) before {}: no TROPOMI data available",
            stats.days_without_data,
            first_data_day()
        );
    }

    if commands.is_empty() {
        println!("• No TROPOMI data available in this period.");
        return Ok(false);
    }

    println!(
        "Planned {} sync command(s) ({} RPRO, {} OFFL)",
        commands.len(),
        stats.reprocessed_commands,
        stats.offline_commands
    );

    let script = render_script(&commands);

    if args.dry_run {
        println!();
        print!("{}", script);
        return Ok(true);
    }

    fs::create_dir_all(&data_dir).await?;

    let script_path = Path::new(&args.script_path);
    write_download_script(script_path, &script).await?;

    println!("Downloading TROPOMI data from AWS");
    let status = run_script(script_path).await?;

    // Cleanup happens before the status check so a failed sync does not
    // leave the generated script behind.
    if !args.keep_script {
        fs::remove_file(script_path).await?;
    }

    if !status.success() {
        return Err(format!("download script exited with {}", status).into());
    }

    println!(
        "✓ Synced {} day(s) of TROPOMI data into {}",
        stats.days_in_period - stats.days_without_data,
        data_dir
    );

    Ok(true)
}

async fn resolve_period(args: &Args) -> Result<(NaiveDate, NaiveDate, String)> {
    if let Some(config_path) = &args.config {
        let raw = fs::read_to_string(config_path)
            .await
            .map_err(|e| format!("could not read config '{}': {}", config_path, e))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| format!("could not parse config '{}': {}", config_path, e))?;
        return Ok((config.start_date, config.end_date, config.data_dir));
    }

    let start_date = args.start_date.as_deref().ok_or("missing start date")?;
    let end_date = args.end_date.as_deref().ok_or("missing end date")?;
    let data_dir = args.data_dir.clone().ok_or("missing data directory")?;

    Ok((
        parse_compact_date(start_date)?,
        parse_compact_date(end_date)?,
        data_dir,
    ))
}

fn parse_compact_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .map_err(|e| format!("invalid date '{}': expected YYYYMMDD ({})", s, e).into())
}

/// First day with any TROPOMI data in the bucket.
fn first_data_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 4, 30).unwrap()
}

/// The reprocessed stream ends where the offline stream begins. Both carry
/// granules for this single day.
fn offline_cutover_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 11, 28).unwrap()
}

/// Collections holding granules for the given day.
///
/// Days before the mission data start map to no collection at all. On the
/// cutover day the reprocessed directory is listed first so its granules
/// are synced before the offline ones.
fn collections_for_day(day: NaiveDate) -> &'static [Collection] {
    if day < first_data_day() {
        &[]
    } else if day < offline_cutover_day() {
        &[Collection::Reprocessed]
    } else if day == offline_cutover_day() {
        &[Collection::Reprocessed, Collection::Offline]
    } else {
        &[Collection::Offline]
    }
}

fn sync_command(
    collection: Collection,
    day: NaiveDate,
    data_dir: &str,
    no_sign_request: bool,
) -> String {
    let mut command = format!(
        "aws s3 sync {}/{}/{}/{}/ {}",
        REMOTE_ROOT,
        collection.key(),
        PRODUCT,
        day.format("%Y/%m/%d"),
        data_dir
    );

    if no_sign_request {
        command.push_str(" --no-sign-request");
    }

    command
}

/// Builds one sync command per (day, collection) pair over the inclusive
/// day range, in day order.
fn build_sync_commands(
    first_day: NaiveDate,
    last_day: NaiveDate,
    data_dir: &str,
    no_sign_request: bool,
) -> (Vec<String>, DownloadStats) {
    let mut commands = Vec::new();
    let mut stats = DownloadStats::default();

    let mut day = first_day;
    while day <= last_day {
        stats.days_in_period += 1;

        let collections = collections_for_day(day);
        if collections.is_empty() {
            stats.days_without_data += 1;
        }

        for &collection in collections {
            match collection {
                Collection::Reprocessed => stats.reprocessed_commands += 1,
                Collection::Offline => stats.offline_commands += 1,
            }
            commands.push(sync_command(collection, day, data_dir, no_sign_request));
        }

        day = day + Duration::days(1);
    }

    (commands, stats)
}

fn render_script(commands: &[String]) -> String {
    let mut script =
        String::from("#!/bin/bash\n\n# This script was generated by download_tropomi\n\n");

    for command in commands {
        script.push_str(command);
        script.push('\n');
    }

    script
}

async fn write_download_script(path: &Path, script: &str) -> Result<()> {
    fs::write(path, script).await?;
    fs::set_permissions(path, Permissions::from_mode(0o755)).await?;
    Ok(())
}

/// Runs the generated script as a child process and hands back its exit
/// status. The path is resolved to an absolute one first so relative
/// script paths do not go through a PATH lookup.
async fn run_script(path: &Path) -> Result<ExitStatus> {
    let script = fs::canonicalize(path).await?;
    let status = Command::new(script).status().await?;
    Ok(status)
}
