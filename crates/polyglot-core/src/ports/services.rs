//! External collaborators: audio storage, speech-to-text, translation.
//!
//! Implementations report failures as `PolyglotError::Transient` (worth
//! retrying) or `PolyglotError::Permanent` (corrupt audio, unsupported
//! language pair, ...). Timeouts are applied by the caller.

use async_trait::async_trait;

use crate::domain::{Language, Result};

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Raw audio bytes behind `audio_ref`.
    async fn fetch(&self, audio_ref: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &[u8], language: &Language) -> Result<String>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, source: &Language, target: &Language) -> Result<String>;
}
