use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use meshio_types::{MacAddr, MeshId};

use meshio_node::config_apply::ConfigApply;
use meshio_node::config_store::{ConfigStore, FileKv};
use meshio_node::hal::{SimGpio, SimPwm};
use meshio_node::input_ctrl::InputCtrl;
use meshio_node::mesh_link::{MeshInbound, MeshLink, MeshOptions};
use meshio_node::mesh_radio::SimHub;
use meshio_node::mqtt_bridge::{
    drive_event_loop, BridgeOptions, ConnectOptions, Inbound, MqttBridge, RumqttcBroker,
};
use meshio_node::now_ms;
use meshio_node::parser::{self, RxMeta, Source};
use meshio_node::pwm_ctrl::PwmCtrl;
use meshio_node::relay_ctrl::RelayCtrl;
use meshio_node::router::Router;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshio_node=info,rumqttc=warn".into()),
        )
        .init();

    // Identity. The station MAC normally comes from the network bring-up;
    // here it is injectable for fleet simulation.
    let mac = std::env::var("MESHIO_LOCAL_MAC")
        .ok()
        .and_then(|s| MacAddr::parse(&s))
        .unwrap_or(MacAddr([0x02, 0, 0, 0, 0, 0x01]));
    let mesh_id = std::env::var("MESHIO_MESH_ID")
        .ok()
        .and_then(|s| MeshId::parse_hex(&s))
        .unwrap_or(MeshId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));

    // Persisted config
    let config_path = env_or("MESHIO_CONFIG_PATH", "meshio-config.json");
    let store = Arc::new(ConfigStore::new(Box::new(FileKv::open(&config_path)), mac));
    let cfg = store.cached().await;
    let dev = cfg.dev_name.clone();
    info!("meshio node {dev} starting (mac {mac})");

    // Drivers on the in-tree HAL (the physical pin matrix lives outside
    // this crate)
    let gpio = Arc::new(SimGpio::new());
    let pwm_hal = Arc::new(SimPwm::new());

    let relays = RelayCtrl::new(gpio.clone());
    relays
        .init(
            &cfg.relays.gpio,
            cfg.relays.active_low_mask,
            cfg.relays.open_drain_mask,
        )
        .context("relay init")?;
    for (ch, &sec) in cfg.relays.autoff_sec.iter().enumerate() {
        relays.set_autoff_seconds(ch, sec).context("relay auto-off")?;
    }

    let pwm = PwmCtrl::new(pwm_hal.clone());
    pwm.init(&cfg.pwm.gpio, cfg.pwm.inverted_mask, cfg.pwm.freq_hz)
        .context("pwm init")?;

    let inputs = InputCtrl::new(gpio.clone());
    inputs
        .init(
            &cfg.inputs.gpio,
            cfg.inputs.pullup_mask,
            cfg.inputs.pulldown_mask,
            cfg.inputs.inverted_mask,
            30,
        )
        .context("input init")?;
    for (ch, &ms) in cfg.inputs.debounce_ms.iter().enumerate() {
        inputs.set_debounce_ms(ch, ms).context("input debounce")?;
    }

    // Broker client + bridge
    let base_prefix = env_or("MESHIO_BASE_PREFIX", "Devices");
    let connect = ConnectOptions {
        host: env_or("MQTT_HOST", "localhost"),
        port: env_or("MQTT_PORT", "1883").parse().unwrap_or(1883),
        client_id: dev.clone(),
        username: env_or("MQTT_USERNAME", ""),
        password: env_or("MQTT_PASSWORD", ""),
        keepalive_s: 30,
        lwt_topic: format!("{base_prefix}/{dev}/Status"),
    };
    let (client, eventloop) = RumqttcBroker::connect(&connect);

    let (inbound_tx, mut inbound_rx) = mpsc::channel(64);
    let mut bridge_opts = BridgeOptions::new(&dev, &mesh_id.to_hex());
    bridge_opts.base_prefix = base_prefix;
    bridge_opts.is_root = true;
    let bridge = MqttBridge::new(client, bridge_opts, inbound_tx);
    tokio::spawn(drive_event_loop(eventloop, bridge.clone()));

    // Mesh link over the in-process hub (the radio stack lives outside
    // this crate); a lone node is its own root
    let hub = SimHub::new(mesh_id);
    let radio = hub.join(mac);
    let (mesh_tx, mut mesh_rx) = mpsc::channel(64);
    let mesh = MeshLink::start(MeshOptions::new(&dev), radio, bridge.clone(), mesh_tx);
    mesh.register_root(Arc::new(|is_root| {
        info!("mesh role: {}", if is_root { "root" } else { "follower" });
    }));

    let router = Router::new(
        &dev,
        bridge.clone(),
        mesh.clone(),
        store.clone(),
        relays.clone(),
        pwm.clone(),
        inputs.clone(),
    );

    // Input edges flow to the router off the driver callback
    let (report_tx, mut report_rx) = mpsc::channel::<(usize, bool)>(32);
    inputs.set_state_hook(Arc::new(move |ch, level| {
        let _ = report_tx.try_send((ch, level));
    }));
    {
        let router = router.clone();
        tokio::spawn(async move {
            while let Some((ch, level)) = report_rx.recv().await {
                router.report_input(ch, level).await;
            }
        });
    }

    // Config apply + reboot signal
    let (reboot_tx, mut reboot_rx) = mpsc::channel::<String>(4);
    let apply = ConfigApply::new(
        &dev,
        store.clone(),
        bridge.clone(),
        router.clone(),
        relays.clone(),
        pwm.clone(),
        inputs.clone(),
        reboot_tx,
    );

    // Broker inbound dispatch
    {
        let router = router.clone();
        let mesh = mesh.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                match inbound {
                    Inbound::Command { topic, payload } => {
                        let meta = RxMeta {
                            source: Some(Source::Mqtt),
                            topic_hint: Some(topic),
                            received_ts_ms: now_ms(),
                        };
                        match parser::parse(&payload, &meta) {
                            Ok(out) => {
                                if !out.unknown_keys.is_empty() {
                                    warn!("unknown fields: {}", out.unknown_keys.join(","));
                                }
                                router.handle(&out.msg).await;
                            }
                            Err(e) => {
                                warn!("command rejected: {e}");
                                router.publish_parse_error(&e, None).await;
                            }
                        }
                    }
                    Inbound::Config { payload, .. } => apply.handle(&payload).await,
                    Inbound::RootCurrent { mac } => mesh.touch_seen_root(&mac),
                }
            }
        });
    }

    // Mesh inbound dispatch
    {
        let router = router.clone();
        tokio::spawn(async move {
            while let Some(msg) = mesh_rx.recv().await {
                match msg {
                    MeshInbound::Request(env) => router.handle_mesh_request(&env).await,
                    MeshInbound::Event(env) => router.handle_mesh_event(&env).await,
                }
            }
        });
    }

    hub.elect_root(mac);

    // A reboot request ends the process; the supervisor restarts it under
    // the refreshed identity.
    if let Some(reason) = reboot_rx.recv().await {
        info!("rebooting: {reason}");
    }
    Ok(())
}
