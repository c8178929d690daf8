//! Stand-in engines for local runs.
//!
//! The "audio" is expected to be UTF-8 text: `EchoSpeechToText` returns it as
//! the transcript and `TaggingTranslator` prefixes the target language.

use async_trait::async_trait;

use polyglot_core::domain::{Language, PolyglotError, Result};
use polyglot_core::ports::{SpeechToText, Translator};

pub struct EchoSpeechToText;

#[async_trait]
impl SpeechToText for EchoSpeechToText {
    async fn transcribe(&self, audio: &[u8], _language: &Language) -> Result<String> {
        let text = std::str::from_utf8(audio)
            .map_err(|e| PolyglotError::Permanent(format!("audio is not UTF-8 text: {e}")))?;
        Ok(text.trim().to_string())
    }
}

pub struct TaggingTranslator;

#[async_trait]
impl Translator for TaggingTranslator {
    async fn translate(&self, text: &str, source: &Language, target: &Language) -> Result<String> {
        if source == target {
            return Ok(text.to_string());
        }
        Ok(format!("[{source}->{target}] {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_rejects_binary_audio() {
        let err = EchoSpeechToText
            .transcribe(&[0xff, 0xfe], &Language::new("en"))
            .await
            .unwrap_err();
        assert!(matches!(err, PolyglotError::Permanent(_)));
    }

    #[tokio::test]
    async fn tagging_marks_language_pair() {
        let text = TaggingTranslator
            .translate("hello", &Language::new("en"), &Language::new("ja"))
            .await
            .unwrap();
        assert_eq!(text, "[en->ja] hello");
    }
}
