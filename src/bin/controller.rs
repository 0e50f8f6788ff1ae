use std::time::Duration;

use anyhow::{Context, Result};
use drc_session::control::{AuthorityRequest, BrokerConfig, DrcModeRequest, StickCommand};
use drc_session::services::{self, FlyToTarget};
use drc_session::simulator::{SimulatedGateway, SimulatorConfig};
use drc_session::state_cache::flight_mode_name;
use drc_session::{DeviceLink, LinkConfig, UnitId};
use tokio::time::interval;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let device_sn = std::env::var("DEVICE_SN").unwrap_or_else(|_| "SIM-GATEWAY-01".to_string());
    let broker_addr =
        std::env::var("DRC_BROKER_ADDR").unwrap_or_else(|_| "127.0.0.1:1883".to_string());
    let username = std::env::var("DRC_USERNAME").unwrap_or_else(|_| "pilot".to_string());
    let password = std::env::var("DRC_PASSWORD").unwrap_or_else(|_| "pilot".to_string());

    let unit_id = UnitId::from(device_sn);
    let (link, gateway) = DeviceLink::loopback(unit_id.clone(), LinkConfig::default())?;
    let sim = SimulatedGateway::spawn(unit_id.clone(), gateway, SimulatorConfig::default());

    info!(unit_id = %unit_id, broker = %broker_addr, "controller started against simulated gateway");

    sim.publish_osd(22.5795, 113.9378, 60.0)?;

    let control = link.control();
    control
        .request_authority(AuthorityRequest::default())
        .await
        .context("requesting control authority")?;

    let broker = BrokerConfig::for_unit(
        &unit_id,
        broker_addr,
        username,
        password,
        Duration::from_secs(3600),
    );
    control
        .enter_mode(DrcModeRequest::builder().broker(broker).build())
        .await
        .context("entering DRC mode")?;

    // A short climb on the virtual sticks at 10 Hz, then back to neutral.
    let mut ticker = interval(Duration::from_millis(100));
    for _ in 0..10 {
        ticker.tick().await;
        control.send_stick(StickCommand {
            throttle: 1364,
            ..StickCommand::neutral()
        })?;
    }
    control.send_stick(StickCommand::neutral())?;

    let target = FlyToTarget::builder()
        .latitude(22.5801)
        .longitude(113.9385)
        .height(120.0)
        .build();
    let fly_to_id = services::fly_to_point(&link, target).await?;
    let outcome = services::wait_for_fly_to(&link, &fly_to_id, Duration::from_secs(30)).await?;

    let position = link.cache().position();
    info!(
        fly_to_id = %fly_to_id,
        status = ?outcome.status,
        latitude = ?position.latitude,
        longitude = ?position.longitude,
        relative_height = ?link.cache().relative_height(),
        mode = link.cache().flight_mode().map(flight_mode_name).unwrap_or("unknown"),
        "fly-to finished"
    );

    if let Some(stats) = control.heartbeat_stats() {
        info!(sent = stats.sent, failures = stats.failures, "heartbeat");
    }

    if let Err(e) = link.shutdown().await {
        warn!(error = %e, "shutdown incomplete");
    }
    info!(calls = ?sim.calls(), heartbeats = sim.heartbeat_seqs().len(), "done");

    Ok(())
}
