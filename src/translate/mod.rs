//! Translation backends and the caching layer in front of them.

pub mod cache;
pub mod deepseek;
pub mod glossary;
pub mod hit_recorder;
pub mod normalize;
pub mod sqlite_cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TranslateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
}

/// A remote service able to translate a batch of strings in one call.
#[async_trait]
pub trait TranslationClient: Send + Sync {
    /// Whether credentials are configured at all.
    fn has_api_key(&self) -> bool;

    /// Cheap round trip to check the service is reachable.
    async fn test_connection(&self) -> bool;

    /// Translate `texts` into `target_lang`.
    /// On success the result has exactly one entry per input, in order.
    async fn translate_batch(
        &self,
        texts: &[String],
        target_lang: &str,
    ) -> Result<Vec<String>, TranslateError>;
}
