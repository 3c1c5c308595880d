use progtree::TaskConfig;
use progtree::cli::{Args, ExecutionMode, run_demo};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("progtree=info")),
        )
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match mode {
        ExecutionMode::Run(config) => {
            info!("Running demo with {} branches", config.branches);
            let completed = run_demo(config).await?;
            if !completed {
                error!("Demo tree did not complete");
                std::process::exit(2);
            }
            Ok(())
        }
        ExecutionMode::ShowConfig => {
            print!("{}", TaskConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}
