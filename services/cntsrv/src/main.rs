//! Counter acquisition service (`cntsrv`)

use clap::Parser;
use tracing::info;

use cntsrv::bootstrap::{self, Args};
use cntsrv::AppConfig;
use errors::CounterResult;

#[tokio::main]
async fn main() -> CounterResult<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    let config = AppConfig::load(args.config.as_deref())?;
    bootstrap::initialize_logging(&args, &service_info, &config)?;
    if !args.no_color {
        common::service_bootstrap::print_startup_banner(&service_info);
    }

    if args.validate {
        bootstrap::validate_configuration(&config)?;
        info!("Validation completed successfully");
        return Ok(());
    }

    config.validate()?;

    if args.test {
        return bootstrap::run_test(&config).await;
    }

    bootstrap::run_service(config).await
}
