//! Gemini Live WebSocket connector for real-time voice interpretation.
//!
//! Implements the bidirectional streaming protocol for Google's Gemini
//! Live API (BidiGenerateContent).
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to Gemini Live endpoint
//! 2. **Setup**: send initial configuration (model, voice, VAD, system prompt,
//!    transcription) and wait for `setupComplete`
//! 3. **Stream**: send audio chunks as `realtimeInput` and relayed text as
//!    `clientContent`, receive translated audio/text as `serverContent`
//! 4. **Close**: `audioStreamEnd`, then a close frame
//!
//! Gemini Live sends its JSON messages as WebSocket Binary frames, including
//! `setupComplete`. Both the handshake and the inbound loop parse JSON from
//! Text and Binary frames alike.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec;
use super::live::{EngineConnector, EngineLink, OutboundMessage};
use super::pipeline::{SessionConfig, DEFAULT_MODEL};
use super::{TranscriptChannel, VoiceEvent};
use crate::error::{Result, SessionError};

// ── Constants ──────────────────────────────────────────────────────

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// How long to wait for `setupComplete` by default.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Inbound event queue capacity.
const EVENT_QUEUE_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── VAD Configuration ──────────────────────────────────────────────

/// Voice Activity Detection sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadSensitivity {
    #[serde(rename = "START_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "START_SENSITIVITY_LOW")]
    Low,
}

/// End-of-speech detection sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndSensitivity {
    #[serde(rename = "END_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "END_SENSITIVITY_LOW")]
    Low,
}

/// Server-side activity detection. The engine decides turn boundaries and
/// reports barge-in through `serverContent.interrupted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    pub disabled: bool,
    #[serde(rename = "startOfSpeechSensitivity")]
    pub start_sensitivity: VadSensitivity,
    #[serde(rename = "endOfSpeechSensitivity")]
    pub end_sensitivity: EndSensitivity,
    /// Milliseconds of audio before detected speech start to include.
    #[serde(rename = "prefixPaddingMs")]
    pub prefix_padding_ms: u32,
    /// Milliseconds of silence before declaring speech ended.
    #[serde(rename = "silenceDurationMs")]
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: VadSensitivity::High,
            end_sensitivity: EndSensitivity::Low,
            prefix_padding_ms: 100,
            silence_duration_ms: 500,
        }
    }
}

// ── Setup message (JSON sent as first frame) ───────────────────────

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction")]
    pub system_instruction: SystemInstruction,
    #[serde(rename = "realtimeInputConfig")]
    pub realtime_input_config: RealtimeInputConfig,
    #[serde(rename = "inputAudioTranscription")]
    pub input_audio_transcription: TranscriptionConfig,
    #[serde(rename = "outputAudioTranscription")]
    pub output_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInputConfig {
    #[serde(rename = "automaticActivityDetection")]
    pub automatic_activity_detection: VadConfig,
}

/// Presence enables transcription; the object itself carries no options.
#[derive(Debug, Default, Serialize)]
pub struct TranscriptionConfig {}

/// Build the setup message for an interpretation session.
pub fn build_setup_message(model: &str, config: &SessionConfig, vad: &VadConfig) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{model}"),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_id.clone(),
                        },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: config.build_system_prompt(),
                }],
            },
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: vad.clone(),
            },
            input_audio_transcription: TranscriptionConfig::default(),
            output_audio_transcription: TranscriptionConfig::default(),
        },
    }
}

// ── Client messages ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk>,
}

/// Audio chunk with MIME type and base64-encoded data.
#[derive(Debug, Serialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
///
/// `mediaChunks` is marked deprecated in favour of `audio`, but the server
/// still ignores `audio` from some clients.
pub fn build_audio_message(pcm: &[u8], sample_rate: u32) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: format!("audio/pcm;rate={sample_rate}"),
                data: codec::encode_base64(pcm),
            }],
        },
    }
}

/// A user turn with `turnComplete: true`, so the engine answers right away.
pub fn build_text_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true,
        }
    })
}

/// Tells the engine to process whatever input it still has buffered.
pub fn build_audio_stream_end_message() -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": {
            "audioStreamEnd": true
        }
    })
}

// ── Server messages ────────────────────────────────────────────────

fn transcription_text(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Parse one JSON server message into events.
///
/// A single message can carry several events (audio plus transcription).
/// Malformed JSON and undecodable audio are dropped with a warning; they do
/// not end the session.
pub fn parse_server_message(json_text: &str) -> Vec<VoiceEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping unparseable Gemini Live message");
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(VoiceEvent::SetupComplete);
    }

    let content = value.get("serverContent");
    if let Some(content) = content {
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::Interrupted);
        }

        // Sessions request AUDIO responses: text parts are not captions,
        // the output transcription is.
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(|v| v.as_array()) {
            for part in parts {
                if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    match codec::decode_base64(data_b64) {
                        Ok(data) if !data.is_empty() => events.push(VoiceEvent::Audio { data }),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Dropping malformed audio chunk"),
                    }
                }
            }
        }
    }

    // Current API versions nest transcriptions inside serverContent; older
    // ones send them top-level. One caption per channel per message.
    for (field, channel) in [
        ("inputTranscription", TranscriptChannel::Input),
        ("outputTranscription", TranscriptChannel::Output),
    ] {
        let text = content
            .and_then(|c| transcription_text(c, field))
            .or_else(|| transcription_text(&value, field));
        if let Some(text) = text {
            events.push(VoiceEvent::Transcript { channel, text });
        }
    }

    if content.and_then(|c| c.get("turnComplete")).and_then(|v| v.as_bool()) == Some(true) {
        events.push(VoiceEvent::TurnComplete);
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(VoiceEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

/// JSON text of a frame, if it carries any. Gemini sends JSON in Binary frames.
fn frame_json(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

// ── Connector ──────────────────────────────────────────────────────

/// Opens Gemini Live sessions.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    api_key: String,
    endpoint: String,
    model: String,
    setup_timeout: Duration,
    vad: VadConfig,
}

impl GeminiLiveConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            vad: VadConfig::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    /// Endpoint with the API key as a query parameter. An endpoint without
    /// a path gets `/` so the request line stays valid.
    fn connect_url(&self) -> anyhow::Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid Gemini Live endpoint {:?}: {e}", self.endpoint))?;
        if url.path().is_empty() {
            url.set_path("/");
        }
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    /// Connect, send setup and wait for `setupComplete` on the unsplit stream.
    async fn handshake(&self, session_id: &str, config: &SessionConfig) -> anyhow::Result<WsStream> {
        let url = self.connect_url()?;

        tracing::info!(
            session_id = %session_id,
            model = %self.model,
            target = config.target_language.as_str(),
            voice = %config.voice_id,
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Gemini Live: {e}"))?;

        let setup = build_setup_message(&self.model, config, &self.vad);
        let setup_json = serde_json::to_string(&setup)?;
        tracing::debug!(session_id = %session_id, setup = %setup_json, "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::text(setup_json))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send setup message: {e}"))?;

        let wait = wait_for_setup(&mut ws_stream, session_id);
        match tokio::time::timeout(self.setup_timeout, wait).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!(
                "Gemini Live setupComplete timeout ({}ms)",
                self.setup_timeout.as_millis()
            ),
        }

        tracing::info!(session_id = %session_id, "Gemini Live setup complete, ready to stream");
        Ok(ws_stream)
    }
}

/// Read frames until `setupComplete`. A server error or close fails the handshake.
async fn wait_for_setup(ws_stream: &mut WsStream, session_id: &str) -> anyhow::Result<()> {
    while let Some(msg_result) = ws_stream.next().await {
        let msg = msg_result.map_err(|e| anyhow::anyhow!("WebSocket error before setupComplete: {e}"))?;
        if let WsMessage::Close(frame) = &msg {
            anyhow::bail!("Connection closed before setupComplete: {frame:?}");
        }
        let Some(text) = frame_json(&msg) else {
            tracing::debug!(session_id = %session_id, msg = ?msg, "Gemini Live setup phase: non-JSON frame");
            continue;
        };
        for event in parse_server_message(text) {
            match event {
                VoiceEvent::SetupComplete => return Ok(()),
                VoiceEvent::Error { message } => anyhow::bail!("Gemini Live rejected setup: {message}"),
                _ => {}
            }
        }
    }
    anyhow::bail!("Stream ended before setupComplete")
}

#[async_trait::async_trait]
impl EngineConnector for GeminiLiveConnector {
    async fn connect(&self, session_id: &str, config: &SessionConfig) -> Result<EngineLink> {
        let ws_stream = self
            .handshake(session_id, config)
            .await
            .map_err(|e| SessionError::HandshakeFailure {
                message: format!("{e:#}"),
            })?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let sid_out = session_id.to_string();
        let input_rate = config.input_sample_rate;
        tokio::spawn(async move {
            outbound_loop(outbound_rx, ws_sender, input_rate, sid_out).await;
        });

        let sid_in = session_id.to_string();
        tokio::spawn(async move {
            inbound_loop(ws_receiver, event_tx, sid_in).await;
        });

        Ok(EngineLink {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}

// ── Internal loops ─────────────────────────────────────────────────

/// Single writer: every outbound frame goes through here in queue order.
async fn outbound_loop(
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut ws_sender: SplitSink<WsStream, WsMessage>,
    input_rate: u32,
    session_id: String,
) {
    let mut audio_chunk_count: u64 = 0;
    let mut total_bytes: u64 = 0;

    while let Some(msg) = rx.recv().await {
        let json = match msg {
            OutboundMessage::Audio(pcm) => {
                audio_chunk_count += 1;
                total_bytes += pcm.len() as u64;
                if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                    tracing::info!(
                        session_id = %session_id,
                        chunk = audio_chunk_count,
                        pcm_bytes = pcm.len(),
                        total_bytes,
                        "Sending audio chunk to Gemini"
                    );
                }
                serde_json::to_string(&build_audio_message(&pcm, input_rate))
            }
            OutboundMessage::Text(text) => {
                tracing::debug!(session_id = %session_id, chars = text.chars().count(), "Sending text turn to Gemini");
                serde_json::to_string(&build_text_message(&text))
            }
            OutboundMessage::AudioStreamEnd => {
                tracing::info!(session_id = %session_id, "Sending audioStreamEnd to Gemini Live");
                serde_json::to_string(&build_audio_stream_end_message())
            }
            OutboundMessage::Close => break,
        };

        let json = match json {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to serialize outbound message");
                continue;
            }
        };
        if ws_sender.send(WsMessage::text(json)).await.is_err() {
            tracing::warn!(session_id = %session_id, "WebSocket send failed, closing outbound loop");
            return;
        }
    }

    let _ = ws_sender.send(WsMessage::Close(None)).await;
    tracing::debug!(session_id = %session_id, "Outbound loop terminated");
}

fn log_inbound(session_id: &str, event: &VoiceEvent, elapsed: f32, audio_count: u64) {
    match event {
        VoiceEvent::Audio { data } => tracing::debug!(
            session_id = %session_id,
            t = format!("{elapsed:.1}s"),
            audio_n = audio_count,
            bytes = data.len(),
            "⬇ Gemini audio response"
        ),
        VoiceEvent::TurnComplete => tracing::info!(
            session_id = %session_id,
            t = format!("{elapsed:.1}s"),
            audio_chunks_this_session = audio_count,
            "⬇ Turn complete"
        ),
        VoiceEvent::Transcript { channel, text } => tracing::info!(
            session_id = %session_id,
            t = format!("{elapsed:.1}s"),
            channel = ?channel,
            text = %text,
            "⬇ Transcript"
        ),
        VoiceEvent::Interrupted => tracing::info!(
            session_id = %session_id,
            t = format!("{elapsed:.1}s"),
            "⬇ Interrupted"
        ),
        _ => {}
    }
}

async fn inbound_loop(
    mut ws_receiver: SplitStream<WsStream>,
    event_tx: mpsc::Sender<VoiceEvent>,
    session_id: String,
) {
    let start_time = std::time::Instant::now();
    let mut audio_response_count: u64 = 0;

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                let _ = event_tx
                    .send(VoiceEvent::TransportError {
                        message: format!("WebSocket error: {e}"),
                    })
                    .await;
                return;
            }
        };

        if let WsMessage::Close(frame) = &msg {
            tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
            break;
        }

        let Some(text) = frame_json(&msg) else {
            if let WsMessage::Binary(data) = &msg {
                if !data.is_empty() {
                    tracing::warn!(
                        session_id = %session_id,
                        len = data.len(),
                        "Unexpected non-JSON binary frame from Gemini Live, skipping"
                    );
                }
            }
            continue;
        };

        let elapsed = start_time.elapsed().as_secs_f32();
        for event in parse_server_message(text) {
            if matches!(event, VoiceEvent::Audio { .. }) {
                audio_response_count += 1;
            }
            log_inbound(&session_id, &event, elapsed, audio_response_count);
            if event_tx.send(event).await.is_err() {
                tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                return;
            }
        }
    }

    let _ = event_tx.send(VoiceEvent::Closed).await;
    tracing::debug!(session_id = %session_id, "Inbound loop terminated");
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::pipeline::{LanguageCode, TargetLanguage};
    use tokio::net::TcpListener;

    #[test]
    fn setup_message_carries_voice_prompt_and_transcription() {
        let config = SessionConfig {
            target_language: TargetLanguage::Fixed(LanguageCode::Ko),
            voice_id: "Puck".into(),
            ..Default::default()
        };
        let msg = build_setup_message(DEFAULT_MODEL, &config, &VadConfig::default());
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["setup"]["model"], format!("models/{DEFAULT_MODEL}"));
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert!(json["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Korean"));
        assert_eq!(json["setup"]["inputAudioTranscription"], serde_json::json!({}));
        assert_eq!(json["setup"]["outputAudioTranscription"], serde_json::json!({}));
        assert_eq!(
            json["setup"]["realtimeInputConfig"]["automaticActivityDetection"]["disabled"],
            false
        );
    }

    #[test]
    fn audio_message_is_base64_pcm_at_input_rate() {
        let msg = build_audio_message(&[0u8, 1, 2, 3], 16_000);
        let json = serde_json::to_value(&msg).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(
            codec::decode_base64(chunk["data"].as_str().unwrap()).unwrap(),
            vec![0u8, 1, 2, 3]
        );
    }

    #[test]
    fn text_message_completes_the_turn() {
        let json = build_text_message("Hola");
        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(json["clientContent"]["turns"][0]["parts"][0]["text"], "Hola");
        assert_eq!(json["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn audio_stream_end_has_no_payload() {
        let json = serde_json::to_string(&build_audio_stream_end_message()).unwrap();
        assert_eq!(json, r#"{"realtimeInput":{"audioStreamEnd":true}}"#);
    }

    #[test]
    fn parse_setup_complete() {
        assert_eq!(parse_server_message(r#"{"setupComplete": {}}"#), vec![VoiceEvent::SetupComplete]);
    }

    #[test]
    fn parse_audio_and_turn_complete() {
        let audio_b64 = codec::encode_base64(&[10u8, 20, 30, 40]);
        let json = format!(
            r#"{{"serverContent": {{"modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{audio_b64}"}}}}]}}, "turnComplete": true}}}}"#
        );
        assert_eq!(
            parse_server_message(&json),
            vec![
                VoiceEvent::Audio {
                    data: vec![10, 20, 30, 40]
                },
                VoiceEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn malformed_audio_is_dropped() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm", "data": "@@not base64@@"}}]}}}"#;
        assert!(parse_server_message(json).is_empty());
    }

    #[test]
    fn parse_interrupted() {
        let events = parse_server_message(r#"{"serverContent": {"interrupted": true}}"#);
        assert_eq!(events, vec![VoiceEvent::Interrupted]);
    }

    #[test]
    fn parse_transcriptions_nested_and_top_level() {
        let nested = parse_server_message(r#"{"serverContent": {"inputTranscription": {"text": "안녕하세요"}}}"#);
        assert_eq!(
            nested,
            vec![VoiceEvent::Transcript {
                channel: TranscriptChannel::Input,
                text: "안녕하세요".into()
            }]
        );

        let top = parse_server_message(r#"{"outputTranscription": {"text": "Hello"}}"#);
        assert_eq!(
            top,
            vec![VoiceEvent::Transcript {
                channel: TranscriptChannel::Output,
                text: "Hello".into()
            }]
        );
    }

    #[test]
    fn empty_transcription_is_ignored() {
        assert!(parse_server_message(r#"{"inputTranscription": {"text": ""}}"#).is_empty());
        assert!(parse_server_message(r#"{"serverContent": {"outputTranscription": {"text": ""}}}"#).is_empty());
    }

    #[test]
    fn model_text_parts_are_not_captions() {
        let events = parse_server_message(r#"{"serverContent": {"modelTurn": {"parts": [{"text": "Hello world"}]}}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn one_output_caption_per_message() {
        let json = r#"{
            "serverContent": {
                "modelTurn": {"parts": [{"text": "Hello world"}]},
                "outputTranscription": {"text": "Hello world"},
                "turnComplete": true
            },
            "outputTranscription": {"text": "Hello world"}
        }"#;
        assert_eq!(
            parse_server_message(json),
            vec![
                VoiceEvent::Transcript {
                    channel: TranscriptChannel::Output,
                    text: "Hello world".into()
                },
                VoiceEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn connect_url_adds_root_path_and_encodes_key() {
        let connector = GeminiLiveConnector::new("a b&c").with_endpoint("ws://127.0.0.1:9000");
        assert_eq!(connector.connect_url().unwrap().as_str(), "ws://127.0.0.1:9000/?key=a+b%26c");

        let default = GeminiLiveConnector::new("k").connect_url().unwrap();
        assert_eq!(default.as_str(), format!("{GEMINI_LIVE_WS_URL}?key=k"));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let connector = GeminiLiveConnector::new("k").with_endpoint("not a url");
        assert!(connector.connect_url().is_err());
    }

    #[test]
    fn parse_error() {
        let events = parse_server_message(r#"{"error": {"message": "Rate limit exceeded"}}"#);
        assert!(matches!(&events[..], [VoiceEvent::Error { message }] if message.contains("Rate limit")));
    }

    #[test]
    fn invalid_json_is_dropped() {
        assert!(parse_server_message("not json at all").is_empty());
    }

    // ── Loopback handshake ────────────────────────────────────────

    async fn loopback_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        (listener, endpoint)
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn handshake_and_duplex_streaming() {
        let (listener, endpoint) = loopback_server().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let setup = next_json(&mut ws).await;
            assert!(setup["setup"]["model"].as_str().unwrap().starts_with("models/"));
            ws.send(WsMessage::binary(br#"{"setupComplete": {}}"#.to_vec()))
                .await
                .unwrap();

            let audio = next_json(&mut ws).await;
            assert_eq!(audio["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");

            let reply = format!(
                r#"{{"serverContent": {{"modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{}"}}}}]}}}}}}"#,
                codec::encode_base64(&[1, 0, 2, 0])
            );
            ws.send(WsMessage::binary(reply.into_bytes())).await.unwrap();

            let end = next_json(&mut ws).await;
            assert_eq!(end["realtimeInput"]["audioStreamEnd"], true);
            ws.close(None).await.ok();
        });

        let connector = GeminiLiveConnector::new("test-key").with_endpoint(endpoint);
        let mut link = connector.connect("s1", &SessionConfig::default()).await.unwrap();

        link.outbound.send(OutboundMessage::Audio(vec![0, 0, 1, 0])).unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(VoiceEvent::Audio {
                data: vec![1, 0, 2, 0]
            })
        );

        link.outbound.send(OutboundMessage::AudioStreamEnd).unwrap();
        link.outbound.send(OutboundMessage::Close).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_is_transport_error() {
        let (listener, endpoint) = loopback_server().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _setup = next_json(&mut ws).await;
            ws.send(WsMessage::binary(br#"{"setupComplete": {}}"#.to_vec()))
                .await
                .unwrap();
            // No close frame: the TCP stream just goes away.
            drop(ws);
        });

        let connector = GeminiLiveConnector::new("test-key").with_endpoint(endpoint);
        let mut link = connector.connect("s1", &SessionConfig::default()).await.unwrap();
        assert!(matches!(
            link.events.recv().await,
            Some(VoiceEvent::TransportError { .. })
        ));
    }

    #[tokio::test]
    async fn close_before_setup_complete_is_handshake_failure() {
        let (listener, endpoint) = loopback_server().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _setup = next_json(&mut ws).await;
            ws.close(None).await.ok();
        });

        let connector = GeminiLiveConnector::new("test-key").with_endpoint(endpoint);
        let err = connector.connect("s1", &SessionConfig::default()).await.err().unwrap();
        assert!(matches!(err, SessionError::HandshakeFailure { .. }));
    }

    #[tokio::test]
    async fn setup_error_message_is_handshake_failure() {
        let (listener, endpoint) = loopback_server().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _setup = next_json(&mut ws).await;
            ws.send(WsMessage::text(r#"{"error": {"message": "API key not valid"}}"#))
                .await
                .ok();
        });

        let connector = GeminiLiveConnector::new("bad").with_endpoint(endpoint);
        match connector.connect("s1", &SessionConfig::default()).await {
            Err(SessionError::HandshakeFailure { message }) => assert!(message.contains("API key not valid")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("handshake should fail"),
        }
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (listener, endpoint) = loopback_server().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _setup = next_json(&mut ws).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let connector = GeminiLiveConnector::new("test-key")
            .with_endpoint(endpoint)
            .with_setup_timeout(Duration::from_millis(100));
        match connector.connect("s1", &SessionConfig::default()).await {
            Err(SessionError::HandshakeFailure { message }) => assert!(message.contains("timeout")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("handshake should time out"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_handshake_failure() {
        let (listener, endpoint) = loopback_server().await;
        drop(listener);
        let connector = GeminiLiveConnector::new("test-key").with_endpoint(endpoint);
        let err = connector.connect("s1", &SessionConfig::default()).await.err().unwrap();
        assert!(matches!(err, SessionError::HandshakeFailure { .. }));
    }
}
