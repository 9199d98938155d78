use anyhow::Result;
use clap::Parser;
use log::info;
use sleep_features::config::{Args, Command};
use sleep_features::{DatasetBuilder, LogObserver};

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Prepare(prepare) => {
            let config = prepare.into_config()?;
            info!(
                "Preprocessing {} (bins {}s, rolling windows {:?})",
                config.raw_dir.display(),
                config.features.bin_seconds,
                config.features.rolling_windows
            );

            let builder = DatasetBuilder::new(config);
            let outcome = builder.run(&mut LogObserver)?;

            let skipped: Vec<&str> = outcome.report.skipped().map(|(user, _)| user).collect();
            info!(
                "{} rows from {} users, {} skipped {:?}",
                outcome.dataset.len(),
                outcome.report.included().count(),
                skipped.len(),
                skipped
            );
            info!("Report written to {}", builder.report_path().display());
        }
    }

    Ok(())
}
