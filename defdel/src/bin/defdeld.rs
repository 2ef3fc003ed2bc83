//! Demo daemon wiring: config, logging, storage, a trivial in-process driver
//! registry, and the periodic tick loop. Real hypervisor drivers and the
//! broker's REST surface are out of scope (`spec.md` §1); this binary exists
//! to exercise the engine end to end against a no-op backend.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use defdel::{
    DeletionEngine, DriverError, DriverIdentity, EngineConfig, ResolutionError, ServiceDriver, ServiceRegistry,
    SystemClock,
};
use defer_ids::{ServiceUuid, VmId};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "defdeld", about = "Deferred VM stop/delete worker")]
struct Cli {
    /// Optional TOML file overriding the compiled-in tunable constants.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the four group files are persisted under.
    #[arg(long, default_value = "./deferdel_worker")]
    data_dir: PathBuf,

    /// Print the CSV report to stdout and exit, without ticking.
    #[arg(long)]
    report: bool,

    /// Run a single tick and exit, instead of looping forever.
    #[arg(long)]
    once: bool,
}

/// A driver that always succeeds immediately, for smoke-testing the engine
/// without a real hypervisor backend.
struct NoopDriver {
    identity: DriverIdentity,
}

#[async_trait]
impl ServiceDriver for NoopDriver {
    fn must_stop_before_deletion(&self) -> bool {
        true
    }

    fn should_try_soft_shutdown(&self) -> bool {
        true
    }

    async fn is_running(&self, _vmid: &VmId) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn shutdown(&self, _vmid: &VmId) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop(&self, _vmid: &VmId) -> Result<(), DriverError> {
        Ok(())
    }

    async fn execute_delete(&self, _vmid: &VmId) -> Result<(), DriverError> {
        Ok(())
    }

    async fn is_deleted(&self, _vmid: &VmId) -> Result<bool, DriverError> {
        Ok(true)
    }

    fn db_obj(&self) -> DriverIdentity {
        DriverIdentity {
            uuid: self.identity.uuid.clone(),
            name: self.identity.name.clone(),
        }
    }
}

/// Resolves the single demo service registered at startup; anything else is
/// an orphan (`spec.md` §6, §8 scenario 6).
struct StaticRegistry {
    driver: Arc<dyn ServiceDriver>,
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn get_instance(&self, service_uuid: &ServiceUuid) -> Result<Arc<dyn ServiceDriver>, ResolutionError> {
        if *service_uuid == self.driver.db_obj().uuid {
            Ok(self.driver.clone())
        } else {
            Err(ResolutionError(service_uuid.clone()))
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let storage = defdel::storage::open_file_storage(&cli.data_dir).await?;

    if cli.report {
        let mut stdout = std::io::stdout();
        defdel::report::report(&storage, &mut stdout).await?;
        return Ok(());
    }

    let demo_driver: Arc<dyn ServiceDriver> = Arc::new(NoopDriver {
        identity: DriverIdentity {
            uuid: ServiceUuid::from("demo-service"),
            name: "noop".to_string(),
        },
    });
    let registry = Arc::new(StaticRegistry { driver: demo_driver });
    let clock = Arc::new(SystemClock);
    let engine = DeletionEngine::new(storage, registry, clock, config.clone());

    if cli.once {
        engine.run().await?;
        return Ok(());
    }

    info!(tick_interval_secs = config.tick_interval_secs, "deferred deletion engine starting");
    let mut ticker = tokio::time::interval(config.tick_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = engine.run().await {
                    warn!(%err, "tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
