//! BMS-to-Victron-CAN gateway daemon entry point.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bms_can_gateway::config::GatewaySettings;
use bms_can_gateway::energy::InMemoryPersistenceStore;
use bms_can_gateway::transport::RecordingCanTransport;
use bms_can_gateway::{Orchestrator, SystemClock};
use log::{error, info, warn};

const CONFIG_PATH_ENV: &str = "BMS_GATEWAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/bms-can-gateway/config.json";

fn load_settings() -> GatewaySettings {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    match fs::read_to_string(&path) {
        Ok(text) => match GatewaySettings::from_json(&text) {
            Ok(settings) => {
                info!("loaded configuration from {}", path.display());
                settings
            }
            Err(e) => {
                error!("config at {} is invalid ({e}); falling back to defaults", path.display());
                GatewaySettings::default()
            }
        },
        Err(e) => {
            warn!("no config file at {} ({e}); using defaults", path.display());
            GatewaySettings::default()
        }
    }
}

fn open_bms_transport(settings: &GatewaySettings) -> Box<dyn bms_can_gateway::transport::BmsTransport> {
    Box::new(
        bms_can_gateway::transport::SerialPortTransport::open(&settings.serial.port, settings.serial.baud_rate)
            .unwrap_or_else(|e| {
                panic!(
                    "cannot open BMS serial port {} at {} baud: {e}",
                    settings.serial.port, settings.serial.baud_rate
                )
            }),
    )
}

#[cfg(feature = "socketcan")]
fn open_can_transport(settings: &GatewaySettings) -> Box<dyn bms_can_gateway::transport::CanTransport> {
    match bms_can_gateway::transport::socketcan_transport::SocketCanTransport::open(&settings.publisher.can_interface) {
        Ok(transport) => Box::new(transport),
        Err(e) => {
            error!(
                "cannot open CAN interface {} ({e}); falling back to a recording transport, frames will not reach the bus",
                settings.publisher.can_interface
            );
            Box::new(RecordingCanTransport::new())
        }
    }
}

#[cfg(not(feature = "socketcan"))]
fn open_can_transport(_settings: &GatewaySettings) -> Box<dyn bms_can_gateway::transport::CanTransport> {
    warn!("built without the socketcan feature; CAN frames are recorded in-process only");
    Box::new(RecordingCanTransport::new())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let settings = load_settings();
    let bms_transport = open_bms_transport(&settings);
    let can_transport = open_can_transport(&settings);
    let persistence = Box::new(InMemoryPersistenceStore::default());
    let clock = Arc::new(SystemClock::new());

    let orchestrator = Orchestrator::start(settings, bms_transport, can_transport, persistence, clock);

    info!("bms-can-gatewayd running; press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}; running until killed");
        std::future::pending::<()>().await;
    }

    info!("shutdown requested");
    tokio::time::timeout(Duration::from_secs(2), orchestrator.shutdown())
        .await
        .unwrap_or_else(|_| warn!("shutdown did not complete within 2s"));
}
