// src/main.rs

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let args = overseer::cli::parse();

    // The log file location comes from the profile, which we can only read
    // after parsing the config; peek at it leniently before full loading.
    let log_dir = overseer::config::load_profile(&args.config, args.profile.as_deref())
        .ok()
        .and_then(|p| p.log_path.map(std::path::PathBuf::from));
    overseer::logging::init_logging(args.log_level, log_dir.as_deref())?;

    overseer::run(args).await
}
