//! Error taxonomy shared by every layer of the SDK.
//!
//! Validation failures (capability, permission, selection) are produced
//! locally before any transport is touched.  Transport, timeout and framing
//! failures bubble up from the lowest layer unchanged.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdkError {
    // ── Capability ──────────────────────────────────────────────────────────
    #[error("Neurosity SDK: {feature} is not supported by model version {model_version}")]
    Unsupported {
        feature: String,
        model_version: String,
    },

    // ── Permission ──────────────────────────────────────────────────────────
    #[error("Neurosity SDK: {function} requires the missing scope(s): {}", missing.join(", "))]
    MissingScopes {
        function: String,
        missing: Vec<String>,
    },

    // ── Selection ───────────────────────────────────────────────────────────
    #[error("Neurosity SDK: you must select a device before calling {0}")]
    NoDeviceSelected(String),

    #[error("Neurosity SDK: device {0} not found in the account's claimed devices")]
    DeviceNotFound(String),

    #[error("Neurosity SDK: you must be logged in to call {0}")]
    NotLoggedIn(String),

    // ── Transport ───────────────────────────────────────────────────────────
    #[error("Neurosity SDK: characteristic {0} not found")]
    CharacteristicNotFound(String),

    #[error("Neurosity SDK: Bluetooth is not connected")]
    NotConnected,

    #[error("Neurosity SDK: a Bluetooth connection attempt is already in progress")]
    Busy,

    #[error("Neurosity SDK: failed to write characteristic {characteristic}: {message}")]
    Write {
        characteristic: String,
        message: String,
    },

    #[error("Neurosity SDK: failed to read characteristic {characteristic}: {message}")]
    Read {
        characteristic: String,
        message: String,
    },

    #[error("Neurosity SDK: failed to start notifications on {characteristic}: {message}")]
    Notify {
        characteristic: String,
        message: String,
    },

    #[error("Neurosity SDK: Bluetooth platform error: {0}")]
    Platform(String),

    #[error("Neurosity SDK: {0} is not available on this transport")]
    NotAvailable(String),

    #[error("Neurosity SDK: cloud error: {0}")]
    Cloud(String),

    #[error("Neurosity SDK: stream closed before a value arrived")]
    StreamClosed,

    // ── Timeout ─────────────────────────────────────────────────────────────
    #[error("Neurosity SDK: no response for action {action_id} after {timeout_ms} ms")]
    Timeout { action_id: String, timeout_ms: u64 },

    // ── Framing ─────────────────────────────────────────────────────────────
    #[error(
        "Neurosity SDK: binary buffer of {len} bytes is not a multiple of the {sample_size}-byte sample size"
    )]
    Framing { len: usize, sample_size: usize },

    #[error("Neurosity SDK: invalid JSON payload: {0}")]
    Json(String),

    #[error("Neurosity SDK: packet is not valid UTF-8: {0}")]
    Encoding(String),

    // ── Usage ───────────────────────────────────────────────────────────────
    #[error("Neurosity SDK: {0} can only be called from a server runtime")]
    ServerOnly(String),

    #[error("Neurosity SDK: {0}")]
    InvalidArgument(String),
}

impl From<serde_json::Error> for SdkError {
    fn from(e: serde_json::Error) -> Self {
        SdkError::Json(e.to_string())
    }
}

pub type SdkResult<T> = Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_message_carries_the_prefix() {
        let errors = [
            SdkError::NotConnected,
            SdkError::CharacteristicNotFound("raw".into()),
            SdkError::Timeout {
                action_id: "42".into(),
                timeout_ms: 5000,
            },
            SdkError::Framing {
                len: 11,
                sample_size: 26,
            },
            SdkError::Encoding("invalid utf-8 sequence of 1 bytes from index 1".into()),
        ];
        for e in errors {
            assert!(e.to_string().starts_with("Neurosity SDK: "), "{e}");
        }
    }

    #[test]
    fn missing_scopes_names_each_scope() {
        let err = SdkError::MissingScopes {
            function: "brainwaves".into(),
            missing: vec!["read:brainwaves".into()],
        };
        assert_eq!(
            err.to_string(),
            "Neurosity SDK: brainwaves requires the missing scope(s): read:brainwaves"
        );
    }

    #[test]
    fn timeout_names_action_and_duration() {
        let err = SdkError::Timeout {
            action_id: "1700000000000".into(),
            timeout_ms: 4000,
        };
        let msg = err.to_string();
        assert!(msg.contains("1700000000000"));
        assert!(msg.contains("4000 ms"));
    }
}
