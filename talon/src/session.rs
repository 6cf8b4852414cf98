use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Login data collected from the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// Display name of this connection profile
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// An authenticated connection to the team server.
///
/// Created on successful login and immutable for the lifetime of the
/// connection; the pinned fingerprint is enforced by the transport on every
/// subsequent request.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub token: String,
    pub fingerprint: Option<String>,
}

impl Session {
    /// Server address as `host:port`.
    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Operator confirmation of a server fingerprint on first contact.
pub trait FingerprintPrompt: Send + Sync {
    fn accept(&self, fingerprint: &str) -> bool;
}

impl<F> FingerprintPrompt for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn accept(&self, fingerprint: &str) -> bool {
        self(fingerprint)
    }
}

/// Log into the team server.
///
/// The login request is the sole unauthenticated call. On first contact
/// (`known_fingerprint` is `None`) the presented fingerprint goes through the
/// operator prompt and a rejection aborts the login; a known fingerprint is
/// compared directly and a divergence is a hard `FingerprintMismatch`.
///
/// On success the token and fingerprint are installed into the transport so
/// every later call is authenticated and pin-checked.
pub async fn login(
    transport: &Transport,
    info: &ConnectInfo,
    known_fingerprint: Option<&str>,
    prompt: &dyn FingerprintPrompt,
) -> Result<Session> {
    let body = serde_json::to_value(info).map_err(|e| Error::Protocol(e.to_string()))?;

    let (status, bytes) = transport.send("/api/login", &body, false).await?;

    if let Some(observed) = transport.observed_fingerprint() {
        match known_fingerprint {
            Some(known) if known != observed => {
                return Err(Error::FingerprintMismatch {
                    pinned: known.to_string(),
                    observed,
                });
            }
            Some(_) => {}
            None => {
                if !prompt.accept(&observed) {
                    return Err(Error::Auth(
                        "server fingerprint rejected by operator".to_string(),
                    ));
                }
            }
        }
    }

    match status {
        200 => {}
        401 => {
            let message = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|o| o.get("error").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| "unauthorized (invalid credentials)".to_string());

            return Err(Error::Auth(message));
        }
        code => return Err(Error::UnexpectedStatus(code)),
    }

    let object: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Protocol(format!("login response: {}", e)))?;

    let token = object
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("login response carries no token".to_string()))?
        .to_string();

    let fingerprint = transport.observed_fingerprint();

    if let Some(fp) = &fingerprint {
        log::info!("ssl fingerprint: {}", fp);
        transport.pin_fingerprint(fp.clone());
    }

    transport.set_token(token.clone());

    Ok(Session {
        name: info.name.clone(),
        host: info.host.clone(),
        port: info.port,
        username: info.username.clone(),
        token,
        fingerprint,
    })
}
