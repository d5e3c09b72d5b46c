//! Device classification and the per-device constants derived from it.
//!
//! Detection runs an ordered list of [`DeviceDetector`] strategies over an
//! [`EnvironmentInfo`] snapshot; the first one that answers wins, and the
//! answer is looked up in a fixed table. The process-wide result is computed
//! once by [`device_specs`] and never re-detected.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::TrainerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    Desktop,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
        })
    }
}

impl FromStr for DeviceType {
    type Err = TrainerError;

    /// Accepts the generic names plus the platform names used by browsers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phone" | "iphone" | "android" | "mobile" => Ok(DeviceType::Phone),
            "tablet" | "ipad" => Ok(DeviceType::Tablet),
            "desktop" | "pc" => Ok(DeviceType::Desktop),
            other => Err(TrainerError::InvalidConfig(format!("unknown device type '{other}'"))),
        }
    }
}

/// Immutable per-session device record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpecs {
    pub device_type: DeviceType,
    /// Default microphone gain for the shared graph.
    pub sensitivity_multiplier: f32,
    /// Display multiplier for volume bars.
    pub volume_bar_scale: f32,
    pub is_touch_primary: bool,
}

impl DeviceSpecs {
    pub fn for_type(device_type: DeviceType) -> Self {
        let (sensitivity_multiplier, volume_bar_scale) = match device_type {
            DeviceType::Phone => (2.0, 4.5),
            DeviceType::Tablet => (7.0, 7.0),
            DeviceType::Desktop => (1.0, 4.0),
        };
        Self {
            device_type,
            sensitivity_multiplier,
            volume_bar_scale,
            is_touch_primary: matches!(device_type, DeviceType::Phone | DeviceType::Tablet),
        }
    }

    /// Volume in `[0, 1]` scaled to a display percentage, capped at 100.
    pub fn volume_percent(&self, volume: f32) -> f32 {
        (volume * 100.0 * self.volume_bar_scale).clamp(0.0, 100.0)
    }
}

impl Default for DeviceSpecs {
    fn default() -> Self {
        Self::for_type(DeviceType::Desktop)
    }
}

/// What the host tells us about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentInfo {
    pub user_agent: String,
    pub platform: String,
    /// Screen size in logical pixels.
    pub screen: Option<(u32, u32)>,
    pub has_touch: bool,
    /// Client-hint style "this is a mobile device" flag, when the host sends one.
    pub mobile_hint: Option<bool>,
    pub override_type: Option<DeviceType>,
}

impl EnvironmentInfo {
    /// Reads `TRAINER_DEVICE_TYPE`, `TRAINER_USER_AGENT` and `TRAINER_SCREEN`
    /// (`WxH`). Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let override_type = std::env::var("TRAINER_DEVICE_TYPE").ok().and_then(|v| match v.parse() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("[DEVICE] ignoring TRAINER_DEVICE_TYPE: {}", e);
                None
            }
        });
        let screen = std::env::var("TRAINER_SCREEN").ok().and_then(|v| {
            let parsed = parse_screen(&v);
            if parsed.is_none() {
                warn!("[DEVICE] ignoring TRAINER_SCREEN '{}', expected WxH", v);
            }
            parsed
        });
        Self {
            user_agent: std::env::var("TRAINER_USER_AGENT").unwrap_or_default(),
            platform: std::env::consts::OS.to_string(),
            screen,
            has_touch: false,
            mobile_hint: None,
            override_type,
        }
    }
}

fn parse_screen(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// iOS reports tablets that fail the user-agent test; the screen decides.
fn tablet_sized(screen: Option<(u32, u32)>) -> bool {
    let Some((w, h)) = screen else { return false };
    let long = w.max(h);
    let short = w.min(h);
    long >= 768 || (long >= 700 && short >= 500)
}

/// One detection strategy. `None` defers to the next strategy.
pub trait DeviceDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, env: &EnvironmentInfo) -> Option<DeviceType>;
}

/// Explicit user or configuration choice.
pub struct OverrideDetector;

impl DeviceDetector for OverrideDetector {
    fn name(&self) -> &'static str {
        "override"
    }

    fn detect(&self, env: &EnvironmentInfo) -> Option<DeviceType> {
        env.override_type
    }
}

/// Authoritative capability report from the host.
pub struct ClientHintsDetector;

impl DeviceDetector for ClientHintsDetector {
    fn name(&self) -> &'static str {
        "client-hints"
    }

    fn detect(&self, env: &EnvironmentInfo) -> Option<DeviceType> {
        match env.mobile_hint? {
            true => Some(DeviceType::Phone),
            false if env.has_touch && tablet_sized(env.screen) => Some(DeviceType::Tablet),
            false => Some(DeviceType::Desktop),
        }
    }
}

/// User-agent matching with the iPadOS desktop-masquerade and screen-size
/// corrections.
pub struct UserAgentDetector;

impl DeviceDetector for UserAgentDetector {
    fn name(&self) -> &'static str {
        "user-agent"
    }

    fn detect(&self, env: &EnvironmentInfo) -> Option<DeviceType> {
        let ua = env.user_agent.as_str();
        let lower = ua.to_ascii_lowercase();
        if lower.contains("android") {
            // Android tablets omit "Mobile" from the user agent.
            return Some(if lower.contains("mobile") { DeviceType::Phone } else { DeviceType::Tablet });
        }
        if ua.contains("iPhone") {
            return Some(DeviceType::Phone);
        }
        // iPadOS 13+ claims to be a Mac; only the touch screen gives it away.
        if ua.contains("iPad") || (ua.contains("Macintosh") && env.has_touch) {
            return Some(DeviceType::Tablet);
        }
        let ios_like = |s: &str| ["iPad", "iPhone", "iPod"].iter().any(|p| s.contains(p));
        if ios_like(ua) || ios_like(&env.platform) {
            return Some(if tablet_sized(env.screen) { DeviceType::Tablet } else { DeviceType::Phone });
        }
        None
    }
}

/// Ordered strategy list; desktop when nobody answers.
pub struct DeviceProfiler {
    detectors: Vec<Box<dyn DeviceDetector>>,
}

impl Default for DeviceProfiler {
    fn default() -> Self {
        Self {
            detectors: vec![
                Box::new(OverrideDetector),
                Box::new(ClientHintsDetector),
                Box::new(UserAgentDetector),
            ],
        }
    }
}

impl DeviceProfiler {
    pub fn with_detectors(detectors: Vec<Box<dyn DeviceDetector>>) -> Self {
        Self { detectors }
    }

    /// Classifies `env`, returning the specs and the name of the strategy
    /// that decided ("default" when none did).
    pub fn detect(&self, env: &EnvironmentInfo) -> (DeviceSpecs, &'static str) {
        for detector in &self.detectors {
            if let Some(device_type) = detector.detect(env) {
                return (DeviceSpecs::for_type(device_type), detector.name());
            }
        }
        (DeviceSpecs::default(), "default")
    }
}

static DEVICE_SPECS: OnceCell<DeviceSpecs> = OnceCell::new();

/// Process-wide device specs, detected from the environment on first use.
pub fn device_specs() -> DeviceSpecs {
    *DEVICE_SPECS.get_or_init(|| {
        let env = EnvironmentInfo::from_env();
        let (specs, source) = DeviceProfiler::default().detect(&env);
        info!(
            "[DEVICE] detected {} via {} (sensitivity {}x, volume bar {}x)",
            specs.device_type, source, specs.sensitivity_multiplier, specs.volume_bar_scale
        );
        specs
    })
}

/// Pins the process-wide specs before first use. Returns `false` if they
/// were already detected.
pub fn set_device_specs(specs: DeviceSpecs) -> bool {
    DEVICE_SPECS.set(specs).is_ok()
}
