mod config;
mod layout;

pub use config::*;
pub use layout::*;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("no space left in cache: {0}")]
    NoSpace(String),
    #[error("remote not ready: {0}")]
    NotReady(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("verify error: {0}")]
    VerifyError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

impl CacheError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => CacheError::NotFound(info),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                CacheError::PermissionDenied(info)
            }
            StatusCode::CONFLICT => CacheError::AlreadyExists(info),
            _ => CacheError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CacheError::NotFound(err.to_string()),
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                CacheError::NoSpace(err.to_string())
            }
            _ => CacheError::IoError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert!(matches!(
            CacheError::from_http_status(StatusCode::NOT_FOUND, "x".into()),
            CacheError::NotFound(_)
        ));
        assert!(matches!(
            CacheError::from_http_status(StatusCode::FORBIDDEN, "x".into()),
            CacheError::PermissionDenied(_)
        ));
        assert!(matches!(
            CacheError::from_http_status(StatusCode::BAD_GATEWAY, "x".into()),
            CacheError::RemoteError(_)
        ));
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(CacheError::from(err).is_not_found());
        let err = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        assert!(matches!(CacheError::from(err), CacheError::NoSpace(_)));
    }
}
