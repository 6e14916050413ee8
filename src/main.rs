//! Standup - 站会机器人
//!
//! 入口：加载配置、初始化日志、打开存储，启动调度循环并在终端上运行控制台。
//!
//! 启动: cargo run -- [config.toml]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use standup::config::load_config;
use standup::console::Console;
use standup::core::{Clock, ShutdownManager, ShutdownReason, SystemClock};
use standup::extraction::FallbackExtractor;
use standup::gateway::ConsoleSpoke;
use standup::llm::create_llm_from_config;
use standup::{AdminService, CycleRepository, ResponseCorrelator, Scheduler, SqliteRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    standup::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    tracing::info!("Workspace '{}', database {}", cfg.app.workspace, cfg.app.db_path.display());

    let repo = Arc::new(
        SqliteRepository::open(&cfg.app.db_path).context("Failed to open standup database")?,
    );
    if repo.load_config().await?.is_none() {
        let seed = cfg.cycle.to_cycle_config();
        seed.validate().context("Invalid [cycle] configuration")?;
        repo.save_config(&seed).await?;
        tracing::info!("Seeded cycle config: {:?}", seed);
    }

    let llm = create_llm_from_config(&cfg.llm);
    let extractor = Arc::new(FallbackExtractor::from_config(&cfg.extraction, llm));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let spoke = Arc::new(ConsoleSpoke::new());

    let scheduler = Arc::new(Scheduler::new(repo.clone(), spoke));
    let correlator = Arc::new(ResponseCorrelator::new(repo.clone(), extractor));
    let admin = Arc::new(AdminService::new(repo.clone(), scheduler.clone(), clock.clone()));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let tick_interval = Duration::from_secs(cfg.app.tick_interval_secs.max(1));
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let clock = clock.clone();
        let token = shutdown.token();
        tokio::spawn(async move { scheduler.run(clock, tick_interval, token).await })
    };

    let console = Console::new(admin, correlator, scheduler, clock);
    if console.run(shutdown.token()).await {
        shutdown.shutdown(ShutdownReason::InputClosed);
    }

    scheduler_task.await.context("Scheduler task panicked")?;
    Ok(())
}
