use thiserror::Error;

/// Failure classes shared by every PayPipe error type.
///
/// The class decides the blast radius: authorization and protocol failures
/// end one call or connection, payment failures end a whole client session,
/// startup failures end the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Authorization,
    Protocol,
    Network,
    Payment,
    Startup,
}

#[derive(Error, Debug)]
pub enum PayPipeError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("License and account address are not same (license {license}, account {account})")]
    AddressMismatch { license: String, account: String },

    #[error("Invalid license: {0}")]
    InvalidLicense(String),

    #[error("License is not valid at {now}")]
    LicenseExpired { now: u64 },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid service descriptor: {0}")]
    InvalidService(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl PayPipeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AddressMismatch { .. } | Self::LicenseExpired { .. } | Self::InvalidSignature => {
                ErrorClass::Authorization
            }
            Self::InvalidAddress(_) | Self::SerializationError(_) => ErrorClass::Protocol,
            Self::InvalidLicense(_) | Self::InvalidService(_) | Self::InvalidConfig(_) => {
                ErrorClass::Startup
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PayPipeError>;
