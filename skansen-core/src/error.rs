use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid prefix '{0}'")]
    InvalidPrefix(String),

    #[error("Prefix length {prefix_len} exceeds {width} bits")]
    PrefixTooLong { prefix_len: u8, width: u8 },

    #[error("Unknown transport protocol '{0}'")]
    InvalidProtocol(String),
}
