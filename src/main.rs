use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crane_sim::cli::{build_cli, handle_subcommands};
use crane_sim::config::SimulationConfig;
use crane_sim::modbus::{HoldingRegisterBank, ModbusTcpServer};
use crane_sim::output::NmeaEncoder;
use crane_sim::services::{ShutdownTrigger, SimulationScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let default_level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let config = SimulationConfig::from_matches(&matches).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if handle_subcommands(&matches, &config).await? {
        return Ok(());
    }

    info!("🏗️  Crane simulator v{}", crane_sim::VERSION);
    info!(
        "📡 {} temperature sensors -> HR[{}..{}], {} telegrams as {}",
        config.sensor_count,
        config.register_base,
        usize::from(config.register_base) + config.sensor_count,
        config.sentence,
        config.talker_id
    );

    let bank = Arc::new(HoldingRegisterBank::new(config.register_count));
    info!("📝 Holding register bank: {} registers", bank.size().await);
    let server = ModbusTcpServer::bind(&config.register_address(), bank.clone())
        .await
        .context("Failed to start Modbus TCP server")?;
    let (server_trigger, server_shutdown) = ShutdownTrigger::new();
    let server_task = tokio::spawn(server.run(server_shutdown));

    let mut scheduler = SimulationScheduler::new(config.clone(), bank, Arc::new(NmeaEncoder))?;
    if let Err(e) = scheduler.start().await {
        server_trigger.trigger();
        let _ = server_task.await;
        return Err(e).context("Failed to start simulation");
    }

    let mut ticks = scheduler.ticks();
    let limit = config.tick_limit;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("🛑 Ctrl-C received"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        },
        _ = ticks.wait_for(|tick| limit.is_some_and(|limit| *tick >= limit)) => {
            info!("🏁 Tick loop finished");
        }
    }

    scheduler.stop().await;
    server_trigger.trigger();
    if tokio::time::timeout(Duration::from_secs(2), server_task).await.is_err() {
        warn!("⏱️  Modbus server did not stop in time");
    }

    info!("👋 Goodbye!");
    Ok(())
}
