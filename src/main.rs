use anyhow::{anyhow, bail, Context};
use lightbox_lib::config::Config;
use lightbox_lib::notify::log_notifier;
use lightbox_lib::query::gear::GearColumn;
use lightbox_lib::query::FilterParams;
use lightbox_lib::scanner::{ScanMode, ScanOutcome};
use lightbox_lib::Library;

const USAGE: &str = "usage: lightbox <scan [default|deep|metadata] | thumbs | timeline | gear <column>>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    lightbox_lib::init_logging();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "scan".to_string());

    let config = Config::from_env().context("failed to load configuration")?;
    let library = Library::open(config, log_notifier()).context("failed to open library")?;

    match command.as_str() {
        "scan" => {
            let mode_arg = args.next().unwrap_or_default();
            let mode = ScanMode::parse(&mode_arg).ok_or_else(|| anyhow!("unknown scan mode: {}", mode_arg))?;
            watch_ctrl_c(&library);
            report(library.scanner.start(mode).await)
        }
        "thumbs" => {
            watch_ctrl_c(&library);
            report(library.scanner.start_thumbnail_sweep().await)
        }
        "timeline" => {
            let response = library.query.timeline(&FilterParams::default())?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        "gear" => {
            let column = GearColumn::parse(&args.next().unwrap_or_default())?;
            println!("{}", serde_json::to_string_pretty(&library.query.gear(column)?)?);
            Ok(())
        }
        _ => bail!("{}", USAGE),
    }
}

fn watch_ctrl_c(library: &Library) {
    let scanner = library.scanner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            scanner.cancel();
        }
    });
}

fn report(outcome: ScanOutcome) -> anyhow::Result<()> {
    match outcome {
        ScanOutcome::Failed { message } => Err(anyhow!(message)),
        other => {
            println!("{}", other.message());
            Ok(())
        }
    }
}
