use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recwatch_browser::{LiveRoomSensor, LmsBrowser};
use recwatch_core::Settings;
use recwatch_run::{
    prepare_tasks, preflight, refresh_mapping, render_preflight, run_harvest, run_monitor,
    BrowserHarvester, Credentials, LiveTableRenderer,
};
use recwatch_storage::MembershipClient;

#[derive(Debug, Parser)]
#[command(name = "recwatch")]
#[command(about = "Class-recording harvester and live room monitor")]
struct Cli {
    /// Settings file with LMS urls, selectors, markers, paths, and timing.
    #[arg(long, default_value = "config/settings.yaml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the external-id -> internal-id course mapping.
    Map,
    /// Join the mapping with the eligible-course list into the task file.
    Prepare,
    /// Extract new recordings for every prepared course.
    Harvest,
    /// Watch today's agenda live.
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.settings)
        .with_context(|| format!("loading settings from {}", cli.settings.display()))?;

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Map => map(&settings).await,
        Commands::Prepare => prepare(&settings),
        Commands::Harvest => harvest(&settings).await,
        Commands::Monitor => monitor(&settings).await,
    }
}

/// Throwaway window: log in, mint cookies, close, then hit the API directly.
async fn map(settings: &Settings) -> Result<()> {
    let creds = Credentials::from_env()?;
    let browser = LmsBrowser::launch(settings, None).await?;
    let cookie_header = match browser.authenticate(&creds.username, &creds.password).await {
        Ok(()) => browser.cookie_header().await?,
        Err(err) => {
            let _ = browser.quit().await;
            return Err(err.into());
        }
    };
    browser.quit().await?;

    let client = MembershipClient::new(cookie_header, Duration::from_secs(20))?;
    let summary = refresh_mapping(settings, &client, &creds.lms_user_id).await?;
    println!(
        "mapping refreshed: {} courses ({} with a period.section code)",
        summary.total, summary.matched
    );
    Ok(())
}

fn prepare(settings: &Settings) -> Result<()> {
    let sep = settings.files.separator;
    let roster = recwatch_storage::load_roster(&settings.paths.roster, sep)
        .context("loading the course mapping (run `map` first)")?;
    let eligible = recwatch_storage::load_eligible(&settings.paths.eligible, sep)?;
    let tasks = prepare_tasks(&roster, &eligible);
    recwatch_storage::save_tasks(&settings.paths.tasks, sep, &tasks)?;
    println!(
        "{} of {} eligible courses are ready to harvest",
        tasks.len(),
        eligible.len()
    );
    Ok(())
}

async fn harvest(settings: &Settings) -> Result<()> {
    let sep = settings.files.separator;
    let creds = Credentials::from_env()?;
    let roster = recwatch_storage::load_roster(&settings.paths.roster, sep)
        .context("loading the course mapping (run `map` first)")?;
    let eligible = recwatch_storage::load_eligible(&settings.paths.eligible, sep)?;
    print!("{}", render_preflight(&preflight(&eligible, &roster)));

    let browser = LmsBrowser::launch(settings, Some(&settings.paths.browser_profile)).await?;
    let result = match browser.authenticate(&creds.username, &creds.password).await {
        Ok(()) => {
            let harvester = BrowserHarvester::new(&browser);
            run_harvest(settings, &harvester).await
        }
        Err(err) => Err(err.into()),
    };
    let quit = browser.quit().await;

    let summary = result?;
    quit?;
    println!(
        "harvest complete: {} new recordings across {} courses in {}s (ledger now {} rows)",
        summary.new_entries,
        summary.courses,
        summary.elapsed_secs(),
        summary.ledger_rows
    );
    Ok(())
}

async fn monitor(settings: &Settings) -> Result<()> {
    let sep = settings.files.separator;
    let creds = Credentials::from_env()?;
    let roster = recwatch_storage::load_roster(&settings.paths.roster, sep)
        .context("loading the course mapping (run `map` first)")?;
    let agenda = recwatch_storage::load_agenda(&settings.paths.agenda, sep)?;
    if agenda.is_empty() {
        println!("agenda is empty; nothing to watch");
        return Ok(());
    }

    let browser = LmsBrowser::launch(settings, Some(&settings.paths.browser_profile)).await?;
    let result = match browser.authenticate(&creds.username, &creds.password).await {
        Ok(()) => {
            let sensor = LiveRoomSensor::new(&browser);
            let mut renderer = LiveTableRenderer::new();
            run_monitor(&sensor, &agenda, &roster, |board| {
                if let Err(err) = renderer.draw(board) {
                    tracing::warn!(error = %err, "table redraw failed");
                }
            })
            .await;
            Ok(())
        }
        Err(err) => Err(anyhow::Error::from(err)),
    };
    browser.quit().await?;
    result
}
