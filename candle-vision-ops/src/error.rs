//! Error types for the vision ops.
//!
//! Failures specific to these ops are described by [`OpError`], which converts into
//! [`candle::Error`] so that every public function keeps returning `candle::Result`.

use candle::Shape;

/// Error raised when the arguments of an op are inconsistent.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// Two paired tensors disagree on a batch, point, channel or spatial dimension.
    #[error("shape mismatch in {op}, expected: {expected:?}, got: {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// A channel count cannot be split evenly into the requested groups.
    #[error("{op}: {what} of {channels} channels cannot be split into {groups} groups")]
    InvalidGroups {
        op: &'static str,
        what: &'static str,
        channels: usize,
        groups: usize,
    },

    /// Any other invalid hyper-parameter (zero stride, kernel larger than the input...).
    #[error("{op}: {msg}")]
    InvalidConfig { op: &'static str, msg: String },
}

impl OpError {
    pub fn shape_mismatch<E: Into<Shape>, G: Into<Shape>>(
        op: &'static str,
        expected: E,
        got: G,
    ) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn invalid_config(op: &'static str, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            op,
            msg: msg.into(),
        }
    }
}

impl From<OpError> for candle::Error {
    fn from(err: OpError) -> Self {
        candle::Error::wrap(err)
    }
}

/// Checks that `groups` is non-zero and divides `channels`.
pub(crate) fn check_groups(
    op: &'static str,
    what: &'static str,
    channels: usize,
    groups: usize,
) -> Result<(), OpError> {
    if groups == 0 || channels % groups != 0 {
        return Err(OpError::InvalidGroups {
            op,
            what,
            channels,
            groups,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_display() {
        let err = OpError::shape_mismatch("three-interpolate", (2, 6, 3), (2, 5, 3));
        let msg = err.to_string();
        assert!(msg.contains("three-interpolate"));
        assert!(msg.contains("[2, 6, 3]"));
        assert!(msg.contains("[2, 5, 3]"));
    }

    #[test]
    fn groups_must_divide_channels() {
        assert!(check_groups("dcn", "input", 4, 2).is_ok());
        let err = check_groups("dcn", "input", 3, 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "dcn: input of 3 channels cannot be split into 2 groups"
        );
        assert!(check_groups("dcn", "input", 3, 0).is_err());
    }

    #[test]
    fn converts_into_candle_error() {
        let err: candle::Error = OpError::invalid_config("dcn", "stride must be positive").into();
        assert!(err.to_string().contains("stride must be positive"));
    }
}
