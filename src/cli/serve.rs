use anyhow::Result;
use console::style;
use tracing::info;

use super::runtime::Runtime;
use crate::core::lifecycle::LifecycleManager;
use crate::core::terminal::GuideSection;

/// Run the coordinator until Ctrl+C: recover interrupted executions, optionally
/// resume schedules, then stop every agent on the way out.
pub async fn run_serve() -> Result<()> {
    let runtime = Runtime::open(false).await?;

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(runtime.manager.clone());
    lifecycle.start().await?;

    let scheduled = runtime.manager.scheduler().scheduled_agents().len();
    GuideSection::new("flowforge")
        .status("Data directory", &format!("{}", runtime.data_dir.display()))
        .status("Scheduled agents", &scheduled.to_string())
        .status(
            "Execution timeout",
            &format!("{}s", runtime.settings.sandbox.timeout_secs),
        )
        .blank()
        .status(
            "Press Ctrl+C to stop.",
            &format!("{}", style("Ctrl+C").bold().yellow()),
        )
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    crate::core::terminal::print_goodbye();
    Ok(())
}
