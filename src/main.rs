use anyhow::Context;
use neovolt::config::Config;
use neovolt::coordinator::Coordinator;
use neovolt::fleet::Fleet;
use neovolt::logging::{get_logger, init_logging};
use neovolt::modbus::ModbusTransport;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config.logging).context("Failed to initialize logging")?;
    let logger = get_logger("main");
    logger.info(&format!(
        "Starting neovolt driver for {} inverter(s)",
        config.inverters.len()
    ));

    let mut coordinators = Vec::with_capacity(config.inverters.len());
    for inverter in &config.inverters {
        let transport = Arc::new(ModbusTransport::new(
            &inverter.name,
            &inverter.host,
            inverter.port,
            inverter.unit_id,
        ));
        coordinators.push(Coordinator::new(&config, inverter, transport)?);
    }
    let mut fleet = Fleet::new(coordinators);

    let cycle = Duration::from_secs(config.polling.min_interval_secs);
    let mut ticker = tokio::time::interval(cycle);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logger.info("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let snapshots = fleet.refresh_all().await;
                let agg = fleet.aggregate(&snapshots);
                if agg.reporting > 0 {
                    logger.info(&format!(
                        "{}/{} inverters: grid {:.0} W, pv {:.0} W, battery {:.0} W, load {}, soc {}",
                        agg.reporting,
                        fleet.len(),
                        agg.grid_power_w,
                        agg.pv_power_w,
                        agg.battery_power_w,
                        agg.house_load_w
                            .map_or_else(|| "unknown".to_string(), |w| format!("{:.0} W", w)),
                        agg.average_soc_percent
                            .map_or_else(|| "unknown".to_string(), |s| format!("{:.1} %", s)),
                    ));
                } else {
                    logger.warn("No inverter produced data this cycle");
                }
            }
        }
    }

    fleet.shutdown().await;
    logger.info("Driver stopped");
    Ok(())
}
