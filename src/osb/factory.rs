//! # Client Factory
//!
//! Builds broker clients from `kf.dev/servicebrokercreds` Secrets.

use crate::config::ControllerConfig;
use crate::constants::{
    BROKER_CREDS_PASSWORD_KEY, BROKER_CREDS_SECRET_TYPE, BROKER_CREDS_URL_KEY,
    BROKER_CREDS_USERNAME_KEY,
};
use crate::osb::client::{HttpOsbClient, HttpOsbClientConfig, OsbClient};
use crate::osb::error::OsbError;
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Broker connection details read from a credentials Secret.
///
/// Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BrokerCredentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BrokerCredentials {
    /// Read credentials from a broker Secret, checking its type and keys
    pub fn from_secret(secret: &Secret) -> Result<Self, OsbError> {
        if secret.type_.as_deref() != Some(BROKER_CREDS_SECRET_TYPE) {
            return Err(OsbError::Configuration(format!(
                "expected Secret to have type {BROKER_CREDS_SECRET_TYPE:?}"
            )));
        }

        let field = |key: &str| -> Result<String, OsbError> {
            let value = secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
                .or_else(|| {
                    secret
                        .string_data
                        .as_ref()
                        .and_then(|data| data.get(key))
                        .cloned()
                });
            value.ok_or_else(|| {
                OsbError::Configuration(format!("expected Secret to have field {key:?}"))
            })
        };

        Ok(Self {
            username: field(BROKER_CREDS_USERNAME_KEY)?,
            password: field(BROKER_CREDS_PASSWORD_KEY)?,
            url: field(BROKER_CREDS_URL_KEY)?,
        })
    }
}

/// Creates broker clients from credentials Secrets
pub trait OsbClientFactory: Send + Sync {
    fn new_client_for_broker(&self, secret: &Secret) -> Result<Arc<dyn OsbClient>, OsbError>;
}

/// Factory producing [`HttpOsbClient`]s
#[derive(Debug, Clone)]
pub struct HttpOsbClientFactory {
    api_version: String,
    timeout: Duration,
}

impl HttpOsbClientFactory {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            api_version: config.osb_api_version.clone(),
            timeout: config.osb_request_timeout(),
        }
    }
}

impl OsbClientFactory for HttpOsbClientFactory {
    fn new_client_for_broker(&self, secret: &Secret) -> Result<Arc<dyn OsbClient>, OsbError> {
        let credentials = BrokerCredentials::from_secret(secret)?;
        let client = HttpOsbClient::new(HttpOsbClientConfig {
            url: credentials.url.clone(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            api_version: self.api_version.clone(),
            timeout: self.timeout,
        })?;
        Ok(Arc::new(client))
    }
}
