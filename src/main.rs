use link_checker::checker::LinkChecker;
use link_checker::cli::Cli;
use link_checker::config::Config;
use link_checker::exclusions::{ExclusionRegistry, OwnerDirectory};
use link_checker::metrics::Metrics;
use link_checker::source::{IdentifierSource, JsonlSource};
use link_checker::store::LinkStore;
use link_checker::logging;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();
    let config = Config::load()?;

    logging::init_logging(Path::new(&config.data_dir).join("logs"))?;
    tracing::info!(
        workers = config.num_workers,
        workset_owner_max_links = config.workset_owner_max_links,
        check_timeout = config.check_timeout,
        "link checker starting"
    );

    let store = Arc::new(LinkStore::open(Path::new(&config.data_dir).join("links"))?);
    let source = Arc::new(JsonlSource::open(&config.source_path)?);

    let directory: OwnerDirectory = Arc::new(RwLock::new(source.owner_directory().await?));
    let exclusions = Arc::new(ExclusionRegistry::new(
        cli.exclusion_file.map(PathBuf::from),
        Arc::clone(&directory),
    ));

    let checker = LinkChecker::new(
        config,
        store,
        source,
        exclusions,
        directory,
        Arc::new(Metrics::new()),
    );
    checker.run().await;

    Ok(())
}
