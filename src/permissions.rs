//! OAuth / API-key scope checks.
//!
//! | function | required scope |
//! |---|---|
//! | `brainwaves` | `read:brainwaves` |
//! | `calm` | `read:calm` |
//! | `focus` | `read:focus` |
//! | `accelerometer` | `read:accelerometer` |
//! | `signal_quality` | `read:signal-quality` |
//! | `status` | `read:devices-status` |
//! | `settings` | `read:devices-settings` |
//! | `get_info` | `read:devices-info` |
//! | `kinesis`, `predictions` | `read:kinesis` |
//! | `add_marker` | `write:brainwave-markers` |
//! | `haptics` | `write:haptics` |
//! | `change_settings` | `write:devices-settings` |
//! | `training` | `write:kinesis` |
//!
//! Sessions without scopes (email/password) pass every check.

use crate::cloud::UserClaims;
use crate::error::{SdkError, SdkResult};

/// Scopes required by a public function, empty when it needs none.
pub fn required_scopes(function: &str) -> &'static [&'static str] {
    match function {
        "brainwaves" => &["read:brainwaves"],
        "calm" => &["read:calm"],
        "focus" => &["read:focus"],
        "accelerometer" => &["read:accelerometer"],
        "signal_quality" => &["read:signal-quality"],
        "status" => &["read:devices-status"],
        "settings" => &["read:devices-settings"],
        "get_info" => &["read:devices-info"],
        "kinesis" | "predictions" => &["read:kinesis"],
        "add_marker" => &["write:brainwave-markers"],
        "haptics" => &["write:haptics"],
        "change_settings" => &["write:devices-settings"],
        "training" => &["write:kinesis"],
        _ => &[],
    }
}

/// Fail with the missing scopes of `function`, before any transport call.
pub fn check(function: &str, claims: Option<&UserClaims>) -> SdkResult<()> {
    let Some(claims) = claims else { return Ok(()) };
    let missing: Vec<String> = required_scopes(function)
        .iter()
        .filter(|scope| !claims.has_scope(scope))
        .map(|scope| scope.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SdkError::MissingScopes {
            function: function.to_owned(),
            missing,
        })
    }
}
