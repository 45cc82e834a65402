use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BuiltInType;

pub type Result<T> = std::result::Result<T, PubSubError>;

/// 32-bit OPC UA status code.
///
/// Only the codes the PubSub data plane produces are named here; the numeric
/// values come from the OPC UA status code space so they interoperate with a
/// host server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const BAD_OUT_OF_MEMORY: StatusCode = StatusCode(0x8003_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_ENCODING_ERROR: StatusCode = StatusCode(0x8006_0000);
    pub const BAD_DECODING_ERROR: StatusCode = StatusCode(0x8007_0000);
    pub const BAD_SECURITY_CHECKS_FAILED: StatusCode = StatusCode(0x8013_0000);
    pub const BAD_NOT_SUPPORTED: StatusCode = StatusCode(0x803D_0000);
    pub const BAD_NOT_IMPLEMENTED: StatusCode = StatusCode(0x8040_0000);
    pub const BAD_CONFIGURATION_ERROR: StatusCode = StatusCode(0x8089_0000);
    pub const BAD_NOT_CONNECTED: StatusCode = StatusCode(0x808A_0000);
    pub const BAD_INVALID_ARGUMENT: StatusCode = StatusCode(0x80AB_0000);
    pub const BAD_CONNECTION_REJECTED: StatusCode = StatusCode(0x80AC_0000);

    pub fn is_good(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    pub fn is_bad(self) -> bool {
        !self.is_good()
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::GOOD
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("connection not established")]
    NotConnected,

    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("security checks failed: {0}")]
    SecurityChecks(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("configuration is locked while the group is frozen")]
    ConfigurationLocked,

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("unknown built-in type on the wire: {type_id}")]
    UnknownField { type_id: u8 },

    #[error("content mask mismatch: {0}")]
    MaskMismatch(&'static str),

    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    #[error("{0:?} values cannot be raw-data encoded")]
    UnsupportedInRawEncoding(BuiltInType),
}

impl PubSubError {
    /// Map the error onto the host server's status code space.
    pub fn status_code(&self) -> StatusCode {
        use PubSubError::*;
        match self {
            InvalidArgument(_) => StatusCode::BAD_INVALID_ARGUMENT,
            Network(_) | Communication(_) => StatusCode::BAD_COMMUNICATION_ERROR,
            NotConnected => StatusCode::BAD_NOT_CONNECTED,
            ConnectionRejected(_) => StatusCode::BAD_CONNECTION_REJECTED,
            SecurityChecks(_) => StatusCode::BAD_SECURITY_CHECKS_FAILED,
            NotImplemented(_) => StatusCode::BAD_NOT_IMPLEMENTED,
            NotSupported(_) => StatusCode::BAD_NOT_SUPPORTED,
            Configuration(_) | ConfigurationLocked => StatusCode::BAD_CONFIGURATION_ERROR,
            Encoding(_) | UnsupportedInRawEncoding(_) => StatusCode::BAD_ENCODING_ERROR,
            Decoding(_) | UnknownField { .. } | MaskMismatch(_) | MalformedPayload(_) => {
                StatusCode::BAD_DECODING_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            PubSubError::InvalidArgument("bad qos".into()).status_code(),
            StatusCode::BAD_INVALID_ARGUMENT
        );
        assert_eq!(
            PubSubError::ConfigurationLocked.status_code(),
            StatusCode::BAD_CONFIGURATION_ERROR
        );
        assert_eq!(
            PubSubError::UnknownField { type_id: 42 }.status_code(),
            StatusCode::BAD_DECODING_ERROR
        );
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::BAD_NOT_CONNECTED.is_bad());
    }
}
