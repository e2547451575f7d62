use thiserror::Error;

/// Helper exit code reported when the requested configuration cannot be used.
pub const EXIT_INCOMPATIBLE_CONFIGURATION: i32 = 1;
/// Helper exit code reported when no hardware configuration could be found at all.
pub const EXIT_NO_VALID_CONFIGURATION: i32 = 2;

/// Why the helper process went away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExitReason {
    #[error("incompatible qsvimpl custom parameter")]
    IncompatibleOverride,
    #[error("the encoder was not initialized")]
    NotInitialized,
    #[error("no valid hardware configuration, make sure a (virtual) display is connected to the iGPU")]
    NoValidConfiguration,
    #[error("exit code {0}")]
    Code(i32),
    #[error("exit code unavailable")]
    Unknown,
}

impl ExitReason {
    /// Maps a helper exit code onto a diagnostic. `have_override` selects the
    /// message for an incompatible configuration.
    pub fn from_exit_code(code: Option<i32>, have_override: bool) -> Self {
        match code {
            Some(EXIT_INCOMPATIBLE_CONFIGURATION) if have_override => Self::IncompatibleOverride,
            Some(EXIT_INCOMPATIBLE_CONFIGURATION) => Self::NotInitialized,
            Some(EXIT_NO_VALID_CONFIGURATION) => Self::NoValidConfiguration,
            Some(code) => Self::Code(code),
            None => Self::Unknown,
        }
    }
}

/// Fatal conditions raised by the bridge. Callers can recover the variant from
/// an `anyhow::Error` with `downcast_ref::<EncoderError>()`.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("helper exited before the init response: {0}")]
    Negotiation(ExitReason),
    #[error("helper exited: {0}")]
    HelperExited(ExitReason),
    #[error("encoder saturated: no free cell in the frame queue")]
    Saturated,
    #[error("completion out of order: expected bitstream {expected:?}, helper reported {actual}")]
    CompletionOrder { expected: Option<usize>, actual: u32 },
    #[error(
        "output resolution {width}x{height} exceeds the 1920x1200 maximum of Sandy Bridge and Ivy Bridge"
    )]
    ResolutionUnsupported { width: u32, height: u32 },
    #[error("invalid buffer layout: {0}")]
    Layout(String),
    #[error("malformed bitstream: {0}")]
    MalformedBitstream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            ExitReason::from_exit_code(Some(EXIT_INCOMPATIBLE_CONFIGURATION), true),
            ExitReason::IncompatibleOverride
        );
        assert_eq!(
            ExitReason::from_exit_code(Some(EXIT_INCOMPATIBLE_CONFIGURATION), false),
            ExitReason::NotInitialized
        );
        assert_eq!(
            ExitReason::from_exit_code(Some(EXIT_NO_VALID_CONFIGURATION), false),
            ExitReason::NoValidConfiguration
        );
        assert_eq!(ExitReason::from_exit_code(Some(-7), true), ExitReason::Code(-7));
        assert_eq!(ExitReason::from_exit_code(None, false), ExitReason::Unknown);
    }

    #[test]
    fn test_error_downcast() {
        let err: anyhow::Error = EncoderError::Saturated.into();
        assert!(matches!(
            err.downcast_ref::<EncoderError>(),
            Some(EncoderError::Saturated)
        ));
    }
}
