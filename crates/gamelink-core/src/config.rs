use serde::{Deserialize, Serialize};

// MARK: - AudioConfiguration

/// Negotiated speaker layout, encoded into the launch query string as
/// `(channel_mask << 16) | channel_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioConfiguration {
    Stereo,
    Surround51,
    Surround71,
}

impl AudioConfiguration {
    pub fn channel_count(&self) -> u32 {
        match self {
            Self::Stereo => 2,
            Self::Surround51 => 6,
            Self::Surround71 => 8,
        }
    }

    pub fn channel_mask(&self) -> u32 {
        match self {
            Self::Stereo => 0x3,
            Self::Surround51 => 0x3F,
            Self::Surround71 => 0x63F,
        }
    }

    pub fn surround_audio_info(&self) -> u32 {
        (self.channel_mask() << 16) | self.channel_count()
    }
}

// MARK: - StreamConfiguration

/// Negotiated stream parameters threaded into the app-launch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfiguration {
    pub width: u32,
    pub height: u32,
    #[serde(alias = "refreshRate")]
    pub refresh_rate: u32,
    /// Host-side streaming optimization (resolution/settings adjustment).
    #[serde(alias = "enableSops")]
    pub enable_sops: bool,
    #[serde(alias = "playLocalAudio")]
    pub play_local_audio: bool,
    pub audio: AudioConfiguration,
    /// Bitmask of gamepads attached at launch.
    #[serde(alias = "gamepadMask")]
    pub gamepad_mask: u32,
    #[serde(alias = "enableHdr")]
    pub enable_hdr: bool,
}

impl Default for StreamConfiguration {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            refresh_rate: 60,
            enable_sops: true,
            play_local_audio: false,
            audio: AudioConfiguration::Stereo,
            gamepad_mask: 0,
            enable_hdr: false,
        }
    }
}

impl StreamConfiguration {
    /// Whether the host treats this resolution as one of its native streaming
    /// modes (720p, 1080p, 4K).
    pub fn is_standard_resolution(&self) -> bool {
        let pixels = self.width as u64 * self.height as u64;
        pixels <= 1280 * 720 || pixels == 1920 * 1080 || pixels == 3840 * 2160
    }
}

#[cfg(test)]
mod tests {
    use super::{AudioConfiguration, StreamConfiguration};

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "width": 2560,
            "height": 1440,
            "refreshRate": 120,
            "enableSops": false,
            "audio": "stereo"
        }"#;

        let cfg: StreamConfiguration = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.refresh_rate, 120);
        assert!(!cfg.enable_sops);
        assert_eq!(cfg.audio, AudioConfiguration::Stereo);
    }

    #[test]
    fn surround_audio_info_packs_mask_and_count() {
        assert_eq!(AudioConfiguration::Stereo.surround_audio_info(), 0x30002);
        assert_eq!(AudioConfiguration::Surround51.surround_audio_info(), 0x3F0006);
    }

    #[test]
    fn standard_resolutions() {
        let mut cfg = StreamConfiguration::default();
        assert!(cfg.is_standard_resolution());

        cfg.width = 2560;
        cfg.height = 1440;
        assert!(!cfg.is_standard_resolution());

        cfg.width = 3840;
        cfg.height = 2160;
        assert!(cfg.is_standard_resolution());
    }
}
