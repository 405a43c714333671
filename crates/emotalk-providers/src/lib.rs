//! Reply-generation capability.
//!
//! A [`ReplyGenerator`] turns a behavior directive plus conversation history
//! into one block of text. Providers may stream tokens internally; callers only
//! see the final concatenated result.

use async_trait::async_trait;

use emotalk_core::types::Turn;

#[cfg(feature = "anthropic")]
pub mod anthropic;
pub mod sse;

/// The reply-generation capability.
///
/// An `Err` always means the capability itself failed (network, status,
/// stream error). Malformed model output is still `Ok`.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Provider identifier (e.g., "anthropic").
    fn id(&self) -> &str;

    /// Produce a completion for `history` conditioned on `directive`.
    async fn complete(&self, directive: &str, history: &[Turn]) -> anyhow::Result<String>;
}
