//! Renderer error taxonomy.
//!
//! Fatal errors abort the current draw/cache operation and propagate to the caller.
//! Recoverable conditions (slot downgrade, skipped filter) are logged instead and never
//! surface here unless strict behavior is requested.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Texture or framebuffer creation failed.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// The batch program could not be built even with a single texture slot.
    #[error("shader compile failed at {slot_count} texture slot(s): {log}")]
    ShaderCompile { slot_count: usize, log: String },

    /// Pixel readback was blocked because the data came from a restricted source.
    #[error("security restriction: {0}")]
    SecurityRestriction(String),

    /// Bad construction option or out-of-range argument.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Backend-level failure that is not one of the above.
    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhaustion(msg.into())
    }

    pub fn shader(slot_count: usize, log: impl Into<String>) -> Self {
        Self::ShaderCompile {
            slot_count,
            log: log.into(),
        }
    }

    pub fn restricted(msg: impl Into<String>) -> Self {
        Self::SecurityRestriction(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// True for errors the renderer may degrade around instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ShaderCompile { slot_count, .. } if *slot_count > 1)
            || matches!(self, Self::SecurityRestriction(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_error_at_one_slot_is_fatal() {
        assert!(!RenderError::shader(1, "link").is_recoverable());
        assert!(RenderError::shader(8, "link").is_recoverable());
    }

    #[test]
    fn display_includes_message() {
        let e = RenderError::exhausted("texture 8192x8192");
        assert_eq!(e.to_string(), "resource exhaustion: texture 8192x8192");
    }

    #[test]
    fn anyhow_converts_into_other() {
        let e: RenderError = anyhow::anyhow!("device lost").into();
        assert!(matches!(e, RenderError::Other(_)));
    }
}
