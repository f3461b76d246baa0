use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use log::{error, info, warn};

use neurosity_rs::protocol::{characteristic, decode_text};
use neurosity_rs::transport::native::NativePlatform;
use neurosity_rs::transport::{BluetoothClient, BluetoothConfig, BluetoothTransport};
use neurosity_rs::types::DeviceStatus;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=neurosity_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    // No cloud session here, so the link is used unauthenticated and only
    // the characteristics the headset exposes without a token will answer.
    let config = BluetoothConfig {
        require_authentication: false,
        auto_connect: false,
        ..Default::default()
    };

    // ── Transport ─────────────────────────────────────────────────────────────
    let platform = NativePlatform::new()
        .await
        .context("opening the Bluetooth adapter")?;
    let ble = Arc::new(BluetoothClient::new(platform, config));

    let mut logs = ble.logs();
    tokio::spawn(async move {
        while let Some(line) = logs.next().await {
            println!("[BLE] {line}");
        }
    });

    // ── Scan ──────────────────────────────────────────────────────────────────
    info!("Scanning for Crown / Notion headsets …");
    let mut scan = ble
        .scan(None)
        .context("this platform does not support scanning")?;
    let device = loop {
        match scan.next().await {
            Some(Ok(devices)) => {
                for d in &devices {
                    info!("  found {} ({}) rssi={:?}", d.name, d.id, d.rssi);
                }
                if let Some(first) = devices.into_iter().next() {
                    break first;
                }
            }
            Some(Err(e)) => return Err(e).context("scan failed"),
            None => anyhow::bail!("scan ended without finding a headset"),
        }
    };
    drop(scan);

    // ── Connect ───────────────────────────────────────────────────────────────
    info!("Connecting to {} …", device.name);
    ble.connect(Some(device)).await?;
    info!("✅  Connected. Press Ctrl-C or type 'q' + Enter to quit.\n");
    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  s  – read the status characteristic once");
    info!("  a  – check authentication\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on an OS thread and relayed, since StdinLock is not Send.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line.trim().to_owned()).is_err() {
                break;
            }
        }
    });

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut status = ble.json_metric(characteristic::STATUS);
    let mut connection = ble.connection();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received.");
                break;
            }
            Some(line) = line_rx.recv() => match line.as_str() {
                "" => {}
                "q" => break,
                "s" => match ble.read_characteristic(characteristic::STATUS).await {
                    Ok(bytes) => println!("[STATUS] {}", decode_text(&bytes)),
                    Err(e) => error!("Status read error: {e}"),
                },
                "a" => match ble.is_authenticated().await {
                    Ok(yes) => println!("[AUTH] authenticated={yes}"),
                    Err(e) => error!("Auth check error: {e}"),
                },
                other => warn!("Unknown command '{other}'"),
            },
            item = status.next() => match item {
                Some(Ok(value)) => match serde_json::from_value::<DeviceStatus>(value) {
                    Ok(s) => println!(
                        "[STATUS] state={:10} battery={:?}% charging={:?} ssid={:?}",
                        s.state, s.battery, s.charging, s.ssid
                    ),
                    Err(e) => warn!("Unreadable status: {e}"),
                },
                Some(Err(e)) => {
                    error!("Status stream failed: {e}");
                    status = futures::stream::pending().boxed();
                }
                None => status = futures::stream::pending().boxed(),
            },
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                info!("Connection: {state:?}");
            }
        }
    }

    drop(status);
    ble.disconnect().await?;
    info!("❌  Disconnected – exiting.");
    Ok(())
}
