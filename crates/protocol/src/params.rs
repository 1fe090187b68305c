//! Synthesis parameters and their allowed ranges

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Sample rates the gateway accepts in `StartSynthesis`
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 16000, 22050, 44100, 48000];

/// Maximum length of a single `RunSynthesis` text fragment, in characters
pub const MAX_TEXT_LEN: usize = 1000;

/// Output container for the audio data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AudioFormat {
    Pcm,
    Wav,
    Mp3,
}

impl AudioFormat {
    /// Case-insensitive parse, matching what clients actually send
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PCM" => Some(Self::Pcm),
            "WAV" => Some(Self::Wav),
            "MP3" => Some(Self::Mp3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm => "PCM",
            Self::Wav => "WAV",
            Self::Mp3 => "MP3",
        }
    }
}

/// `StartSynthesis` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_volume")]
    pub volume: u32,

    #[serde(default)]
    pub speech_rate: i32,

    #[serde(default)]
    pub pitch_rate: i32,

    #[serde(default)]
    pub enable_subtitle: bool,
}

fn default_voice() -> String {
    "default".to_string()
}
fn default_format() -> String {
    "PCM".to_string()
}
fn default_sample_rate() -> u32 {
    22050
}
fn default_volume() -> u32 {
    50
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            format: default_format(),
            sample_rate: default_sample_rate(),
            volume: default_volume(),
            speech_rate: 0,
            pitch_rate: 0,
            enable_subtitle: false,
        }
    }
}

impl StartParams {
    /// Validate every field against its allowed set or range.
    ///
    /// Voice resolvability is the catalog's concern, not checked here.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.voice.trim().is_empty() {
            return Err(ProtocolError::invalid_parameter("voice", "must not be empty"));
        }
        if AudioFormat::parse(&self.format).is_none() {
            return Err(ProtocolError::invalid_parameter(
                "format",
                format!("unsupported audio format: {}", self.format),
            ));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ProtocolError::invalid_parameter(
                "sample_rate",
                format!("unsupported sample rate: {}", self.sample_rate),
            ));
        }
        if self.volume > 100 {
            return Err(ProtocolError::invalid_parameter(
                "volume",
                "must be within 0..=100",
            ));
        }
        if !(-500..=500).contains(&self.speech_rate) {
            return Err(ProtocolError::invalid_parameter(
                "speech_rate",
                "must be within -500..=500",
            ));
        }
        if !(-500..=500).contains(&self.pitch_rate) {
            return Err(ProtocolError::invalid_parameter(
                "pitch_rate",
                "must be within -500..=500",
            ));
        }
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        // validate() has already rejected anything unparseable
        AudioFormat::parse(&self.format).unwrap_or(AudioFormat::Pcm)
    }
}
