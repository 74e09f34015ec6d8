use async_trait::async_trait;
use frontdesk_core::ports::{AudioCodec, CodecError, TranscribedWord, Transcription, VoiceOptions};

/// Treats audio payloads as UTF-8 text. Used by the development server and
/// tests in place of a speech provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextPassthroughCodec;

const WORD_MS: u32 = 300;

#[async_trait]
impl AudioCodec for TextPassthroughCodec {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<Transcription, CodecError> {
        if !mime_type.starts_with("text/") && mime_type != "application/octet-stream" {
            return Err(CodecError::UnsupportedFormat(mime_type.to_string()));
        }
        let text = std::str::from_utf8(audio)
            .map_err(|error| CodecError::Transcription(format!("payload is not UTF-8: {error}")))?
            .trim()
            .to_string();

        let words: Vec<TranscribedWord> = text
            .split_whitespace()
            .zip(0u32..)
            .map(|(word, position)| TranscribedWord {
                word: word.to_string(),
                start_ms: position * WORD_MS,
                end_ms: (position + 1) * WORD_MS,
                confidence: 1.0,
            })
            .collect();
        let confidence = if words.is_empty() { 0.0 } else { 1.0 };

        Ok(Transcription { text, confidence, words })
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceOptions) -> Result<Vec<u8>, CodecError> {
        Ok(text.as_bytes().to_vec())
    }
}
