// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime context for mode resolution.

use ppl_core::{EngineError, InferMode};

/// Environment variable that overrides every in-config inference mode.
pub const MODE_OVERRIDE_ENV: &str = "PPL_INFER_MODE";

/// Immutable per-process runtime context.
///
/// The mode override is read from the environment exactly once at startup;
/// per-call code never rereads it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeContext {
    mode_override: Option<InferMode>,
}

impl RuntimeContext {
    /// Read the context from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the override variable is set to
    /// an unrecognised value.
    pub fn from_env() -> Result<Self, EngineError> {
        match std::env::var(MODE_OVERRIDE_ENV) {
            Ok(raw) => {
                let mode = raw.parse::<InferMode>().map_err(|_| {
                    EngineError::Config(format!(
                        "{MODE_OVERRIDE_ENV} must be auto|regular|stream, got: {raw}"
                    ))
                })?;
                Ok(Self {
                    mode_override: Some(mode),
                })
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// A context with an explicit override (tests, embedding callers).
    pub fn with_override(mode: Option<InferMode>) -> Self {
        Self {
            mode_override: mode,
        }
    }

    /// Resolve the effective mode for one call.
    ///
    /// Precedence, highest first: environment override, explicit caller
    /// argument, step field, `auto`.
    pub fn resolve_mode(
        &self,
        caller: Option<InferMode>,
        step: Option<InferMode>,
    ) -> InferMode {
        self.mode_override
            .or(caller)
            .or(step)
            .unwrap_or(InferMode::Auto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_auto() {
        let ctx = RuntimeContext::default();
        assert_eq!(ctx.resolve_mode(None, None), InferMode::Auto);
    }

    #[test]
    fn step_field_beats_default() {
        let ctx = RuntimeContext::default();
        assert_eq!(
            ctx.resolve_mode(None, Some(InferMode::Stream)),
            InferMode::Stream
        );
    }

    #[test]
    fn caller_beats_step() {
        let ctx = RuntimeContext::default();
        assert_eq!(
            ctx.resolve_mode(Some(InferMode::Regular), Some(InferMode::Stream)),
            InferMode::Regular
        );
    }

    #[test]
    fn override_beats_everything() {
        let ctx = RuntimeContext::with_override(Some(InferMode::Stream));
        assert_eq!(
            ctx.resolve_mode(Some(InferMode::Regular), Some(InferMode::Regular)),
            InferMode::Stream
        );
    }
}
