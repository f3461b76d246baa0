//! # neurosity-rs
//!
//! Async Rust SDK for [Neurosity](https://neurosity.co/) EEG headsets.  Metrics
//! and commands travel either through the cloud (Wi-Fi) or over a local
//! Bluetooth Low Energy link, behind one API.
//!
//! ## Transports
//!
//! | Transport | Carries | Notes |
//! |---|---|---|
//! | cloud | every metric and command, device claims, sessions | backend is pluggable via [`cloud::CloudTransport`] |
//! | Bluetooth | status, settings, raw EEG, PSD, focus/calm, signal quality, accelerometer, commands | needs model ≥ 3 running OS ≥ 16 |
//!
//! Which one is used is decided by the [`streaming::StreamingMode`] given in
//! [`client::ClientConfig`], re-evaluated live as connectivity changes.
//!
//! ## Quick start
//!
//! ```no_run
//! use neurosity_rs::prelude::*;
//! use futures::StreamExt;
//!
//! # async fn demo(cloud: std::sync::Arc<dyn CloudTransport>) -> anyhow::Result<()> {
//! let client = NeurosityClient::new(ClientConfig::default(), cloud, None);
//! client.login(Credentials::ApiKey("nsk_…".into())).await?;
//!
//! let mut focus = client.focus();
//! while let Some(score) = focus.next().await {
//!     println!("focus {:.2}", score?.probability);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`client`] | [`client::NeurosityClient`], the facade |
//! | [`streaming`] | Streaming-mode selection between cloud and Bluetooth |
//! | [`cloud`] | Cloud capability trait and metric subscriptions |
//! | [`transport`] | Bluetooth transport, platform bindings and the in-memory mock |
//! | [`correlator`] | Action/response correlation by action id |
//! | [`permissions`] | OAuth scope table |
//! | [`stream`] | Multicast and switch stream primitives |
//! | [`stitch`] | Reassembly of delimited packets from BLE notifications |
//! | [`parse`] | Binary and CSV EEG sample decoders |
//! | [`epoch`] | Sample-to-epoch batching |
//! | [`types`] | Data types produced and consumed by the SDK |
//! | [`protocol`] | GATT UUIDs, characteristic names and wire constants |
//! | [`error`] | [`error::SdkError`] |

pub mod client;
pub mod cloud;
pub mod correlator;
pub mod epoch;
pub mod error;
pub mod parse;
pub mod permissions;
pub mod protocol;
pub mod stitch;
pub mod stream;
pub mod streaming;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::client::{ClientConfig, NeurosityClient, Runtime};
    pub use crate::cloud::{CloudTransport, Credentials, User, UserClaims};
    pub use crate::error::{SdkError, SdkResult};
    pub use crate::stream::MetricStream;
    pub use crate::streaming::{ActiveMode, StreamingMode, StreamingState};

    // ── Bluetooth ─────────────────────────────────────────────────────────────
    #[cfg(feature = "native")]
    pub use crate::transport::native::NativePlatform;
    pub use crate::transport::{BluetoothClient, BluetoothConfig, BluetoothTransport, ScanFilter};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::types::{
        Accelerometer, Action, Brainwaves, ConnectionState, DeviceInfo, DeviceStatus, Epoch,
        Prediction, Probability, Sample, Settings, SignalQuality, TrainingOptions,
    };
}
