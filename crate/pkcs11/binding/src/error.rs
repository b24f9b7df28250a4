//! Copyright 2024 Cosmian Tech SAS

use std::fmt::{self, Display, Formatter};

use pkcs11_sys::{
    CK_RV, CK_ULONG, CKR_ARGUMENTS_BAD, CKR_BUFFER_TOO_SMALL, CKR_CANCEL,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DATA_INVALID,
    CKR_DATA_LEN_RANGE, CKR_DEVICE_ERROR, CKR_DEVICE_MEMORY, CKR_DEVICE_REMOVED,
    CKR_ENCRYPTED_DATA_INVALID, CKR_ENCRYPTED_DATA_LEN_RANGE, CKR_FUNCTION_FAILED,
    CKR_FUNCTION_NOT_SUPPORTED, CKR_GENERAL_ERROR, CKR_HOST_MEMORY, CKR_KEY_FUNCTION_NOT_PERMITTED,
    CKR_KEY_HANDLE_INVALID, CKR_KEY_SIZE_RANGE, CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID, CKR_OK, CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT, CKR_RANDOM_NO_RNG, CKR_SESSION_CLOSED,
    CKR_SESSION_HANDLE_INVALID, CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};
use thiserror::Error;

pub type BResult<T> = Result<T, BindingError>;

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("{0}")]
    Default(String),

    #[error("Error loading the PKCS#11 provider: {0}")]
    ProviderLoad(#[from] libloading::Error),

    #[error("C_{operation} failed: {status}")]
    NativeCall {
        operation: &'static str,
        status: CallStatus,
    },

    #[error(
        "C_{operation} reported {reported} output bytes but the output buffer only holds \
         {capacity} bytes"
    )]
    BufferSize {
        operation: &'static str,
        reported: CK_ULONG,
        capacity: usize,
    },

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Invalid mechanism: {0}")]
    Mechanism(String),

    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl BindingError {
    pub(crate) const fn native_call(operation: &'static str, rv: CK_RV) -> Self {
        Self::NativeCall {
            operation,
            status: CallStatus::Rv(rv),
        }
    }

    pub(crate) const fn invalid_length(operation: &'static str) -> Self {
        Self::NativeCall {
            operation,
            status: CallStatus::InvalidLength,
        }
    }

    /// The raw PKCS#11 return value carried by a `NativeCall` error, if any
    #[must_use]
    pub const fn rv(&self) -> Option<CK_RV> {
        match self {
            Self::NativeCall {
                status: CallStatus::Rv(rv),
                ..
            } => Some(*rv),
            _ => None,
        }
    }

    /// The name of the failing entry point (without the `C_` prefix)
    #[must_use]
    pub const fn operation(&self) -> Option<&'static str> {
        match self {
            Self::NativeCall { operation, .. } | Self::BufferSize { operation, .. } => {
                Some(*operation)
            }
            _ => None,
        }
    }
}

/// Outcome of a provider call that did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// The provider returned this non-`CKR_OK` value
    Rv(CK_RV),
    /// The provider returned `CKR_OK` with a length this layer cannot represent
    InvalidLength,
}

impl Display for CallStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rv(rv) => write!(f, "{} ({rv:#010x})", rv_name(*rv)),
            Self::InvalidLength => write!(f, "invalid length returned by the provider"),
        }
    }
}

/// Map a status to a `BResult`, `CKR_OK` being the only success.
pub(crate) fn check_rv(operation: &'static str, rv: CK_RV) -> BResult<()> {
    if rv == CKR_OK {
        Ok(())
    } else {
        Err(BindingError::native_call(operation, rv))
    }
}

/// Convert a length reported by the provider.
pub(crate) fn reported_len(operation: &'static str, len: CK_ULONG) -> BResult<usize> {
    usize::try_from(len).map_err(|_| BindingError::invalid_length(operation))
}

/// Symbolic name of the most common PKCS#11 return values
#[must_use]
pub fn rv_name(rv: CK_RV) -> &'static str {
    match rv {
        CKR_OK => "CKR_OK",
        CKR_CANCEL => "CKR_CANCEL",
        CKR_HOST_MEMORY => "CKR_HOST_MEMORY",
        CKR_SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
        CKR_GENERAL_ERROR => "CKR_GENERAL_ERROR",
        CKR_FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
        CKR_ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
        CKR_DATA_INVALID => "CKR_DATA_INVALID",
        CKR_DATA_LEN_RANGE => "CKR_DATA_LEN_RANGE",
        CKR_DEVICE_ERROR => "CKR_DEVICE_ERROR",
        CKR_DEVICE_MEMORY => "CKR_DEVICE_MEMORY",
        CKR_DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
        CKR_ENCRYPTED_DATA_INVALID => "CKR_ENCRYPTED_DATA_INVALID",
        CKR_ENCRYPTED_DATA_LEN_RANGE => "CKR_ENCRYPTED_DATA_LEN_RANGE",
        CKR_FUNCTION_NOT_SUPPORTED => "CKR_FUNCTION_NOT_SUPPORTED",
        CKR_KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
        CKR_KEY_SIZE_RANGE => "CKR_KEY_SIZE_RANGE",
        CKR_KEY_TYPE_INCONSISTENT => "CKR_KEY_TYPE_INCONSISTENT",
        CKR_KEY_FUNCTION_NOT_PERMITTED => "CKR_KEY_FUNCTION_NOT_PERMITTED",
        CKR_MECHANISM_INVALID => "CKR_MECHANISM_INVALID",
        CKR_MECHANISM_PARAM_INVALID => "CKR_MECHANISM_PARAM_INVALID",
        CKR_OPERATION_ACTIVE => "CKR_OPERATION_ACTIVE",
        CKR_OPERATION_NOT_INITIALIZED => "CKR_OPERATION_NOT_INITIALIZED",
        CKR_PIN_INCORRECT => "CKR_PIN_INCORRECT",
        CKR_SESSION_CLOSED => "CKR_SESSION_CLOSED",
        CKR_SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
        CKR_TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
        CKR_USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
        CKR_USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
        CKR_RANDOM_NO_RNG => "CKR_RANDOM_NO_RNG",
        CKR_BUFFER_TOO_SMALL => "CKR_BUFFER_TOO_SMALL",
        CKR_CRYPTOKI_NOT_INITIALIZED => "CKR_CRYPTOKI_NOT_INITIALIZED",
        CKR_CRYPTOKI_ALREADY_INITIALIZED => "CKR_CRYPTOKI_ALREADY_INITIALIZED",
        _ => "CKR_UNKNOWN",
    }
}
