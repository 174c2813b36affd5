mod actuator;
mod sim;
mod status;

use anyhow::{bail, Context, Result};
use std::{env, net::SocketAddr, str::FromStr, time::Duration};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_core::codec::{Codec, WireFormat};
use irrigation_core::config::{self, FileConfigStore};
use irrigation_core::controller;
use irrigation_core::dispatch::{Dispatcher, FollowUp};
use irrigation_core::irrigation::{IrrigationController, Transition};
use irrigation_core::mesh::{MeshEngine, MeshSettings};
use irrigation_core::packet::{BROADCAST, GATEWAY};
use irrigation_core::radio::{LinkQuality, Transport, UdpRadio};
use irrigation_core::registry::NodeRegistry;
use irrigation_core::sensor::Sensor;
use irrigation_core::service::{Delivery, RadioService, RetryPolicy};
use irrigation_core::telemetry::Alert;
use irrigation_core::Error;

use actuator::{RelayBoard, RelayPins};
use sim::{FieldSim, Scenario};
use status::StatusPanel;

/// Pause between empty radio polls.
const POLL_EVERY: Duration = Duration::from_millis(20);

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Comma separated `host:port` list.
fn parse_peers(list: &str) -> Result<Vec<SocketAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .with_context(|| format!("bad RADIO_PEERS entry '{s}'"))
        })
        .collect()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("irrigation_node=info,irrigation_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    // ── Env config ──────────────────────────────────────────────────
    let node_id: u8 = env_parse("NODE_ID", 1);
    if node_id == GATEWAY || node_id == BROADCAST {
        bail!("NODE_ID {node_id} is reserved");
    }
    let bind: SocketAddr = env::var("RADIO_BIND")
        .unwrap_or_else(|_| format!("0.0.0.0:{}", 4700 + u16::from(node_id)))
        .parse()
        .context("bad RADIO_BIND")?;
    let peers = parse_peers(&env::var("RADIO_PEERS").unwrap_or_else(|_| "127.0.0.1:4700".to_string()))?;
    let format = WireFormat::from_str_lossy(&env::var("WIRE_FORMAT").unwrap_or_default());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| format!("node-{node_id}.toml"));
    let sample_every = Duration::from_secs(env_parse("SAMPLE_EVERY_S", 300_u64).max(1));
    let heartbeat_every = Duration::from_secs(env_parse("HEARTBEAT_EVERY_S", 60_u64).max(1));
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let day_length: f64 = env_parse("SIM_DAY_S", 86_400.0);
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .map(|v| parse_flag(&v))
        .unwrap_or(true);

    // ── Relays, sensing, controller ─────────────────────────────────
    let board = RelayBoard::new(RelayPins::default(), active_low)?;
    let mut sensor = FieldSim::new(scenario, day_length, board.watering_flag());

    let store = FileConfigStore::new(&config_path);
    let cfg = config::load_or_default(&store);
    info!(
        path = %config_path,
        threshold = cfg.soil_moisture_threshold,
        duration_s = cfg.duration_secs,
        auto = cfg.auto_mode,
        "irrigation config"
    );
    let (handle, controller_task) = controller::spawn(IrrigationController::new(cfg, board), store);

    // ── Radio ───────────────────────────────────────────────────────
    let radio = UdpRadio::bind(bind, peers.clone(), LinkQuality::default())
        .with_context(|| format!("binding radio socket {bind}"))?;
    let mut svc = RadioService::new(
        radio,
        Codec::new(format),
        MeshEngine::new(node_id, MeshSettings::default()),
        NodeRegistry::default(),
    );
    let mut dispatcher = Dispatcher::new(
        node_id,
        GATEWAY,
        handle,
        StatusPanel::default(),
        RetryPolicy::default(),
    );
    info!(node = node_id, %bind, ?peers, %format, scenario = %sensor.scenario(), "node started");

    // ── Main loop ───────────────────────────────────────────────────
    let mut poll = interval(POLL_EVERY);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sample = interval(sample_every);
    let mut heartbeat = interval(heartbeat_every);
    let mut inbox: Vec<Delivery> = Vec::new();

    loop {
        tokio::select! {
            _ = poll.tick() => {
                svc.poll(Instant::now(), &mut inbox);
                for delivery in inbox.drain(..) {
                    let follow = dispatcher
                        .handle_packet(&mut svc, delivery.packet, delivery.link)
                        .await;
                    if follow == FollowUp::SendReading {
                        sample_and_send(&mut sensor, &mut dispatcher, &mut svc).await;
                    }
                }
            }
            _ = sample.tick() => {
                sample_and_send(&mut sensor, &mut dispatcher, &mut svc).await;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = dispatcher.send_heartbeat(&mut svc).await {
                    debug!(error = %e, "heartbeat not delivered");
                }
                info!("{}", dispatcher.sink().summary());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    // Fail-safe: pump and valve off before exit.
    if let Err(e) = dispatcher.controller().stop().await {
        warn!(error = %e, "could not stop controller cleanly");
    }
    drop(dispatcher);
    controller_task.await.context("controller task")?;
    Ok(())
}

/// Take one reading, let auto mode react to it, then report it.
async fn sample_and_send<T: Transport>(
    sensor: &mut FieldSim,
    dispatcher: &mut Dispatcher<StatusPanel>,
    svc: &mut RadioService<T>,
) {
    let reading = sensor.read_all();
    match dispatcher.controller().check_conditions(reading).await {
        Ok(Transition::None) => {}
        Ok(transition) => info!(?transition, soil = reading.soil_moisture, "auto mode"),
        Err(Error::Actuator(reason)) => {
            let alert = Alert::Fault {
                node_id: svc.node_id(),
                reason,
            };
            dispatcher.raise_alert(svc, alert);
        }
        Err(e @ Error::SafetyViolation(_)) => error!(error = %e, "auto start refused"),
        Err(e) => warn!(error = %e, "condition check failed"),
    }
    if let Err(e) = dispatcher.send_reading(svc, &reading).await {
        debug!(error = %e, "reading not delivered");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
