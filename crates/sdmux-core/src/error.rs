//! Error types for discovery operations.
//!
//! Errors fall into two classes. Local precondition failures
//! ([`ServiceError::AlreadyStarted`], [`ServiceError::MissingCallback`], the TXT
//! size limits) are returned synchronously by the call that violated them.
//! Provider failures ([`ProviderError`]) are discovered asynchronously and are
//! delivered through the operation's callback as a terminal error.

use std::fmt;
use thiserror::Error;

/// Result type alias using [`ServiceError`] as the error type.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced to users of discovery operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The operation is active: it cannot be mutated or started again.
    #[error("already started")]
    AlreadyStarted,

    /// The operation was started without a callback.
    #[error("no callback set")]
    MissingCallback,

    /// A single TXT pair would exceed the 255 byte string limit.
    #[error("TXT string may not exceed 255 bytes")]
    TxtPairTooLarge,

    /// The TXT record as a whole would exceed 65535 bytes.
    #[error("TXT size may not exceed 65535 bytes")]
    TxtRecordTooLarge,

    /// Error reported by the discovery provider.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The readiness poller itself failed.
    #[error("poll server failure: {0}")]
    Runtime(String),
}

impl ServiceError {
    /// Returns the provider error code if this error came from the provider.
    pub fn provider_code(&self) -> Option<i32> {
        match self {
            ServiceError::Provider(e) => Some(e.code()),
            _ => None,
        }
    }

    /// Creates a runtime error from anything displayable.
    pub fn runtime(reason: impl fmt::Display) -> Self {
        Self::Runtime(reason.to_string())
    }
}

macro_rules! provider_errors {
    ($( $(#[$doc:meta])* $variant:ident = $code:literal, $desc:literal; )+) => {
        /// Errors reported by the discovery provider.
        ///
        /// The catalogue mirrors the numeric codes of the DNS Service Discovery
        /// API. Codes outside the catalogue are kept as
        /// [`ProviderError::Unrecognized`] together with the raw value.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ProviderError {
            $( $(#[$doc])* $variant, )+
            /// A code that is not part of the catalogue.
            Unrecognized(i32),
        }

        impl ProviderError {
            /// Maps a provider status code to an error. `0` means success.
            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    0 => None,
                    $( $code => Some(ProviderError::$variant), )+
                    other => Some(ProviderError::Unrecognized(other)),
                }
            }

            /// Numeric code of the error.
            pub fn code(&self) -> i32 {
                match self {
                    $( ProviderError::$variant => $code, )+
                    ProviderError::Unrecognized(code) => *code,
                }
            }

            /// Human readable description of the error.
            pub fn description(&self) -> &'static str {
                match self {
                    $( ProviderError::$variant => $desc, )+
                    ProviderError::Unrecognized(_) => "Unknown",
                }
            }
        }
    };
}

provider_errors! {
    /// Generic failure reported by the provider.
    Unknown = -65537, "Unknown";
    NoSuchName = -65538, "No Such Name";
    NoMemory = -65539, "No Memory";
    BadParam = -65540, "Bad Param";
    BadReference = -65541, "Bad Reference";
    BadState = -65542, "Bad State";
    BadFlags = -65543, "Bad Flags";
    Unsupported = -65544, "Unsupported";
    NotInitialized = -65545, "Not Initialized";
    AlreadyRegistered = -65547, "Already Registered";
    NameConflict = -65548, "Name Conflict";
    Invalid = -65549, "Invalid";
    Firewall = -65550, "Firewall";
    Incompatible = -65551, "Incompatible";
    BadInterfaceIndex = -65552, "Bad Interface Index";
    Refused = -65553, "Refused";
    NoSuchRecord = -65554, "No Such Record";
    NoAuth = -65555, "No Auth";
    NoSuchKey = -65556, "No Such Key";
    NatTraversal = -65557, "NAT Traversal";
    DoubleNat = -65558, "Double NAT";
    BadTime = -65559, "Bad Time";
    BadSig = -65560, "Bad Sig";
    BadKey = -65561, "Bad Key";
    Transient = -65562, "Transient";
    /// The provider daemon is not running, or the runtime was shut down.
    ServiceNotRunning = -65563, "Service Not Running";
    NatPortMappingUnsupported = -65564, "NAT Port Mapping Unsupported";
    NatPortMappingDisabled = -65565, "NAT Port Mapping Disabled";
    NoRouter = -65566, "No Router";
    PollingMode = -65567, "Polling Mode";
    Timeout = -65568, "Timeout";
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

impl std::error::Error for ProviderError {}

/// Errors related to configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
