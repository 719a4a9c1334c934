//! Session configuration: languages, voice, sample rates and playback policy.
//!
//! A [`SessionConfig`] is built once at `start()` and stays immutable until
//! the session is torn down.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Sample rate of audio sent to the engine (PCM16 mono).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized audio received from the engine (PCM16 mono).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Gemini Live model used for native-audio interpretation.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Prebuilt voice used when none is configured.
pub const DEFAULT_VOICE: &str = "Aoede";

// ── Language codes ───────────────────────────────────────────────

/// ISO 639-1 language codes supported as interpretation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LanguageCode {
    Ko,
    Ja,
    Zh,
    ZhTw,
    Th,
    Vi,
    Id,
    Hi,
    En,
    Es,
    Fr,
    De,
    It,
    Pt,
    Nl,
    Pl,
    Sv,
    Ru,
    Uk,
    Tr,
    Ar,
}

impl LanguageCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ko => "ko",
            Self::Ja => "ja",
            Self::Zh => "zh",
            Self::ZhTw => "zh-TW",
            Self::Th => "th",
            Self::Vi => "vi",
            Self::Id => "id",
            Self::Hi => "hi",
            Self::En => "en",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
            Self::Pt => "pt",
            Self::Nl => "nl",
            Self::Pl => "pl",
            Self::Sv => "sv",
            Self::Ru => "ru",
            Self::Uk => "uk",
            Self::Tr => "tr",
            Self::Ar => "ar",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Ko => "Korean",
            Self::Ja => "Japanese",
            Self::Zh => "Chinese (Simplified)",
            Self::ZhTw => "Chinese (Traditional)",
            Self::Th => "Thai",
            Self::Vi => "Vietnamese",
            Self::Id => "Indonesian",
            Self::Hi => "Hindi",
            Self::En => "English",
            Self::Es => "Spanish",
            Self::Fr => "French",
            Self::De => "German",
            Self::It => "Italian",
            Self::Pt => "Portuguese",
            Self::Nl => "Dutch",
            Self::Pl => "Polish",
            Self::Sv => "Swedish",
            Self::Ru => "Russian",
            Self::Uk => "Ukrainian",
            Self::Tr => "Turkish",
            Self::Ar => "Arabic",
        }
    }

    /// Parse from string code (case-insensitive).
    pub fn from_str_code(code: &str) -> Option<Self> {
        match code.to_lowercase().as_str() {
            "ko" => Some(Self::Ko),
            "ja" => Some(Self::Ja),
            "zh" => Some(Self::Zh),
            "zh-tw" | "zh_tw" => Some(Self::ZhTw),
            "th" => Some(Self::Th),
            "vi" => Some(Self::Vi),
            "id" => Some(Self::Id),
            "hi" => Some(Self::Hi),
            "en" => Some(Self::En),
            "es" => Some(Self::Es),
            "fr" => Some(Self::Fr),
            "de" => Some(Self::De),
            "it" => Some(Self::It),
            "pt" => Some(Self::Pt),
            "nl" => Some(Self::Nl),
            "pl" => Some(Self::Pl),
            "sv" => Some(Self::Sv),
            "ru" => Some(Self::Ru),
            "uk" => Some(Self::Uk),
            "tr" => Some(Self::Tr),
            "ar" => Some(Self::Ar),
            _ => None,
        }
    }
}

/// Interpretation target: a fixed language, or "auto".
///
/// With `Auto` the engine is asked to detect the input language and answer
/// in the other language of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetLanguage {
    #[default]
    Auto,
    Fixed(LanguageCode),
}

impl TargetLanguage {
    /// Parse `"auto"` or a language code.
    pub fn parse(code: &str) -> Result<Self> {
        if code.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        LanguageCode::from_str_code(code)
            .map(Self::Fixed)
            .ok_or_else(|| SessionError::Config {
                message: format!("unsupported target language: {code}"),
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fixed(code) => code.as_str(),
        }
    }
}

impl Serialize for TargetLanguage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TargetLanguage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Self::parse(&code).map_err(serde::de::Error::custom)
    }
}

// ── Product policy ───────────────────────────────────────────────

/// Playback and interruption behaviour that differs between deployments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackPolicy {
    /// Whether a Speaker hears the synthesized translation of their own speech.
    pub speaker_hears_translation: bool,
    /// Stereo position of synthesized audio, `-1.0` (left) to `1.0` (right).
    pub output_pan: f32,
    /// Whether renewed local speech interrupts pending playback (Speaker only).
    pub local_barge_in: bool,
}

impl Default for PlaybackPolicy {
    fn default() -> Self {
        Self {
            speaker_hears_translation: false,
            output_pan: 0.0,
            local_barge_in: true,
        }
    }
}

/// Capture sources a Speaker asks for. Each one is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRequest {
    pub microphone: bool,
    pub system_audio: bool,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            microphone: true,
            system_audio: false,
        }
    }
}

// ── Session configuration ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub target_language: TargetLanguage,
    /// Prebuilt engine voice name.
    pub voice_id: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub policy: PlaybackPolicy,
    pub capture: CaptureRequest,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_language: TargetLanguage::Auto,
            voice_id: DEFAULT_VOICE.to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            policy: PlaybackPolicy::default(),
            capture: CaptureRequest::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(SessionError::Config {
                message: "sample rates must be non-zero".into(),
            });
        }
        if self.voice_id.trim().is_empty() {
            return Err(SessionError::Config {
                message: "voice_id must not be empty".into(),
            });
        }
        if !(-1.0..=1.0).contains(&self.policy.output_pan) {
            return Err(SessionError::Config {
                message: format!("output_pan {} is outside [-1, 1]", self.policy.output_pan),
            });
        }
        Ok(())
    }

    /// System instruction sent with the engine setup message.
    pub fn build_system_prompt(&self) -> String {
        let direction = match self.target_language {
            TargetLanguage::Auto => "Detect the language of each utterance. \
                 Translate it into the other language of the conversation; \
                 if there is no other language yet, translate it into English."
                .to_string(),
            TargetLanguage::Fixed(code) => format!(
                "Translate everything you hear into {} only.",
                code.display_name()
            ),
        };

        format!(
            "You are a live interpreter. {direction} \
             Preserve the speaker's tone, emphasis, and intent. \
             CRITICAL: Speak the translation IMMEDIATELY. Never explain, never describe what you are doing, \
             never answer questions yourself. Just speak the translated words directly."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_code_roundtrip() {
        for code in [LanguageCode::Ko, LanguageCode::ZhTw, LanguageCode::Es, LanguageCode::Ar] {
            assert_eq!(LanguageCode::from_str_code(code.as_str()), Some(code));
        }
        assert_eq!(LanguageCode::from_str_code("ZH_TW"), Some(LanguageCode::ZhTw));
        assert_eq!(LanguageCode::from_str_code("xx"), None);
    }

    #[test]
    fn target_language_parses_auto_and_codes() {
        assert_eq!(TargetLanguage::parse("AUTO").unwrap(), TargetLanguage::Auto);
        assert_eq!(
            TargetLanguage::parse("es").unwrap(),
            TargetLanguage::Fixed(LanguageCode::Es)
        );
        assert!(matches!(
            TargetLanguage::parse("klingon"),
            Err(SessionError::Config { .. })
        ));
    }

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.target_language, TargetLanguage::Auto);
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert!(!config.policy.speaker_hears_translation);
        assert!(config.policy.local_barge_in);
        assert!(config.capture.microphone);
        assert!(!config.capture.system_audio);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_pan_and_voice() {
        let mut config = SessionConfig::default();
        config.policy.output_pan = 1.5;
        assert!(config.validate().is_err());

        let config = SessionConfig {
            voice_id: "  ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn system_prompt_names_fixed_target() {
        let config = SessionConfig {
            target_language: TargetLanguage::Fixed(LanguageCode::Ja),
            ..Default::default()
        };
        let prompt = config.build_system_prompt();
        assert!(prompt.contains("Japanese"));
        assert!(prompt.contains("interpreter"));
    }

    #[test]
    fn system_prompt_auto_detects() {
        let prompt = SessionConfig::default().build_system_prompt();
        assert!(prompt.contains("Detect the language"));
    }

    #[test]
    fn session_config_deserializes_from_partial_json() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"target_language": "fr", "policy": {"output_pan": -1.0}}"#)
                .unwrap();
        assert_eq!(config.target_language, TargetLanguage::Fixed(LanguageCode::Fr));
        assert_eq!(config.policy.output_pan, -1.0);
        assert!(config.policy.local_barge_in);
        assert_eq!(config.voice_id, DEFAULT_VOICE);
    }
}
