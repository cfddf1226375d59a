//! Facade-level error: everything [`crate::ProxyHandle::start`] can fail on
//! beyond what [`mcpproxy_core::ProxyError`] already covers — opening the
//! storage directory.

use thiserror::Error;

pub type FacadeResult<T> = std::result::Result<T, FacadeError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FacadeError {
    #[error("failed to open storage directory: {0}")]
    Storage(#[from] sled::Error),

    #[error("failed to create storage directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proxy(#[from] mcpproxy_core::ProxyError),

    #[error(transparent)]
    Auth(#[from] mcpproxy_auth::AuthError),
}
