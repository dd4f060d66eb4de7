//! Request-level error taxonomy.
//!
//! Every failing operation surfaces an HTTP status plus a stable machine
//! `code` and a human `message`; the serialized form is `{code, message}`
//! with the status carried out of band.

use cgs_attestation::{AttestationError, PolicyError};
use cgs_crypto::CryptoError;
use cgs_kv::KvError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    #[serde(skip)]
    pub status: u16,
    pub code: String,
    pub message: String,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(400, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(403, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(404, code, message)
    }

    pub fn method_not_allowed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(405, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(409, code, message)
    }

    pub fn precondition_failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(412, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "InternalError", message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(503, code, message)
    }
}

impl From<KvError> for ServiceError {
    fn from(err: KvError) -> Self {
        let message = err.to_string();
        match err {
            KvError::AlreadyExists => Self::conflict("AlreadyExists", message),
            KvError::PreconditionFailed => Self::precondition_failed("PreconditionFailed", message),
            KvError::VersionSuppliedForNewItem => {
                Self::bad_request("VersionSuppliedForNewItem", message)
            }
            KvError::ViewNotKnown => Self::service_unavailable("ViewNotKnown", message),
            KvError::InvalidVersion(_) => Self::bad_request("InvalidVersion", message),
        }
    }
}

impl From<AttestationError> for ServiceError {
    fn from(err: AttestationError) -> Self {
        let message = err.to_string();
        match err {
            AttestationError::ReportDataMismatch => Self::bad_request("ReportDataMismatch", message),
            _ => Self::bad_request("VerifySnpAttestationFailed", message),
        }
    }
}

impl From<CryptoError> for ServiceError {
    fn from(err: CryptoError) -> Self {
        let message = err.to_string();
        match err {
            CryptoError::SignatureMismatch => Self::bad_request("SignatureMismatch", message),
            CryptoError::InvalidPublicKey(_) | CryptoError::InvalidBase64(_) => {
                Self::bad_request("InvalidInput", message)
            }
            _ => Self::internal(message),
        }
    }
}

impl From<PolicyError> for ServiceError {
    fn from(err: PolicyError) -> Self {
        ServiceError::bad_request("InvalidCleanRoomPolicy", err.to_string())
    }
}
