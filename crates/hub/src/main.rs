mod bridge;
mod mqtt;
mod state;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_core::ack::AckSettings;
use irrigation_core::codec::{Codec, WireFormat};
use irrigation_core::mesh::{MeshEngine, MeshSettings};
use irrigation_core::message::Command;
use irrigation_core::packet::GATEWAY;
use irrigation_core::radio::{LinkQuality, Transport, UdpRadio};
use irrigation_core::registry::NodeRegistry;
use irrigation_core::service::RadioService;

use bridge::Gateway;
use mqtt::{MqttSink, Publisher, TOPIC_COMMANDS, TOPIC_CONFIG};
use state::{SharedState, SystemState};

const POLL_EVERY: Duration = Duration::from_millis(20);
const HOUSEKEEPING_EVERY: Duration = Duration::from_secs(1);
const NODE_CHECK_EVERY: Duration = Duration::from_secs(10);

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

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("irrigation_hub=info,irrigation_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let stale_after_s: u64 = env::var("STALE_AFTER_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(180);
    let bind: SocketAddr = env::var("RADIO_BIND")
        .unwrap_or_else(|_| "0.0.0.0:4700".to_string())
        .parse()
        .context("bad RADIO_BIND")?;
    let peers = parse_peers(&env::var("RADIO_PEERS").unwrap_or_else(|_| "127.0.0.1:4701".to_string()))?;
    let format = WireFormat::from_str_lossy(&env::var("WIRE_FORMAT").unwrap_or_default());

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started");

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!(error = %e, "status api stopped");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("irrigation-hub", broker.clone(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<(u8, Command)>(32);
    tokio::spawn(run_mqtt(eventloop, client.clone(), inbound_tx, Arc::clone(&shared)));

    // ── Radio ───────────────────────────────────────────────────────
    let radio = UdpRadio::bind(bind, peers.clone(), LinkQuality::default())
        .with_context(|| format!("binding radio socket {bind}"))?;
    let svc = RadioService::new(
        radio,
        Codec::new(format),
        MeshEngine::new(GATEWAY, MeshSettings::default()),
        NodeRegistry::new(Duration::from_secs(stale_after_s)),
    );
    let mut gw = Gateway::new(svc, AckSettings::default(), MqttSink::new(client));
    info!(%bind, ?peers, %format, broker = %broker, port, "gateway started");

    // ── Gateway loop ────────────────────────────────────────────────
    let mut poll = interval(POLL_EVERY);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut housekeeping = interval(HOUSEKEEPING_EVERY);
    let mut node_check = interval(NODE_CHECK_EVERY);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if gw.poll(Instant::now()) > 0 {
                    publish_state(&mut gw, &shared).await;
                }
            }
            Some((node, command)) = inbound_rx.recv() => {
                if let Err(e) = gw.send_command(node, &command, Instant::now()) {
                    warn!(node, error = %e, "command not sent");
                    shared.write().await.record_error(format!("node {node}: {e}"));
                }
            }
            _ = housekeeping.tick() => {
                gw.retry_commands(Instant::now());
                publish_state(&mut gw, &shared).await;
            }
            _ = node_check.tick() => {
                gw.check_nodes(Instant::now());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    info!(
        nodes = gw.service().registry().len(),
        pending_acks = gw.pending_acks(),
        "gateway stopped"
    );
    Ok(())
}

/// Copy gateway events and the network view into the status API state.
async fn publish_state<T: Transport, P: Publisher>(gw: &mut Gateway<T, P>, shared: &SharedState) {
    let events = gw.take_events();
    let network = gw.network(Instant::now());
    let mut st = shared.write().await;
    for event in events {
        st.record(event.kind, event.detail);
    }
    st.network = network;
}

/// Drive the MQTT connection. Subscriptions are renewed on every connect;
/// inbound commands are handed to the gateway loop.
async fn run_mqtt(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound: mpsc::Sender<(u8, Command)>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                for topic in [TOPIC_COMMANDS, TOPIC_CONFIG] {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        warn!(topic, error = %e, "subscribe failed");
                    }
                }
                shared.write().await.set_mqtt_connected(true);
            }
            Ok(Event::Incoming(Packet::Publish(p))) => match mqtt::parse_inbound(&p.topic, &p.payload) {
                Ok((node, command)) => {
                    info!(node, command = %command, "command from mqtt");
                    if inbound.send((node, command)).await.is_err() {
                        break;
                    }
                }
                Err(msg) => {
                    warn!(topic = %p.topic, "{msg}");
                    shared.write().await.record_error(msg);
                }
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                shared.write().await.set_mqtt_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                shared.write().await.set_mqtt_connected(false);
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
