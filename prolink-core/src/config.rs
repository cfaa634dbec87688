//! Engine configuration: network identity plus every tunable the rest of
//! the core reads a default from.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{PlayerId, WaveformStyle, DEFAULT_SLACK};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name this process announces itself under, e.g. "prolink-core".
    pub name: String,
    pub device_num: PlayerId,
    /// Network interface to bind to; `None` picks the first IPv4 interface.
    pub interface_name: Option<String>,

    /// How long a peer can go unheard-from before it's considered gone.
    #[serde(with = "duration_secs")]
    pub peer_timeout: Duration,

    /// Default dead-reckoning slack before a movement event fires; can be
    /// overridden per subscription.
    #[serde(with = "duration_millis")]
    pub default_slack: Duration,

    /// Whether to trust CDJ-3000 precise-position packets over beat-derived
    /// timing when both are available.
    pub use_precise_packets: bool,

    /// Preferred waveform detail rendering, when a player offers more than
    /// one style.
    pub preferred_waveform_style: WaveformStyle,

    /// Whether to fetch full waveform detail in addition to the preview;
    /// disable to save a dbserver round trip when only the preview is used.
    pub find_waveform_detail: bool,

    /// How long a single dbserver menu operation may run before the loader
    /// gives up on it.
    #[serde(with = "duration_secs")]
    pub menu_op_timeout: Duration,

    /// Total time the loader will keep retrying an "unanalyzed" track
    /// before giving up.
    #[serde(with = "duration_secs")]
    pub analysis_wait_total: Duration,

    /// Interval between unanalyzed-track retries.
    #[serde(with = "duration_secs")]
    pub analysis_retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: "prolink-core".to_string(),
            device_num: 5,
            interface_name: None,
            peer_timeout: Duration::from_secs(10),
            default_slack: DEFAULT_SLACK,
            use_precise_packets: true,
            preferred_waveform_style: WaveformStyle::Rgb,
            find_waveform_detail: true,
            menu_op_timeout: Duration::from_secs(20),
            analysis_wait_total: Duration::from_secs(90),
            analysis_retry_interval: Duration::from_secs(10),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
