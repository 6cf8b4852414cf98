pub mod tls;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use reqwest::header::CONNECTION;
use serde_json::Value;

use crate::error::{Error, Result};
use tls::{PinState, PinVerifier};

/// Header carrying the session token on every authenticated request.
pub const TOKEN_HEADER: &str = "x-talon-token";

/// Timeout applied to regular requests. Keep-alive requests (long-poll agent
/// execution, the event stream) run without a total timeout since they
/// legitimately wait on remote command completion.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTPS transport to the team server.
///
/// All requests are POSTs with JSON bodies. The TLS layer pins the server
/// certificate by SHA-256 fingerprint instead of validating the chain; after
/// login the pinned fingerprint is enforced on every call and a mismatch
/// permanently poisons the transport.
pub struct Transport {
    base: String,
    token: Mutex<Option<String>>,
    pin: Arc<PinState>,
    http: reqwest::Client,
    http_keep_alive: reqwest::Client,
}

impl Transport {
    /// Transport for `https://host:port`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_base(format!("https://{}:{}", host, port))
    }

    /// Transport against an explicit base url.
    pub fn with_base(base: impl Into<String>) -> Result<Self> {
        let pin = Arc::new(PinState::new());

        let tls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(PinVerifier::new(pin.clone())))
            .with_no_client_auth();

        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let http_keep_alive = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Transport {
            base: base.into(),
            token: Mutex::new(None),
            pin,
            http,
            http_keep_alive,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Store the session token attached to all subsequent requests.
    pub fn set_token(&self, token: String) {
        *self.token.lock().unwrap() = Some(token);
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    /// Pin the server certificate fingerprint enforced from now on.
    pub fn pin_fingerprint(&self, fingerprint: String) {
        self.pin.pin(fingerprint);
    }

    /// Fingerprint presented by the peer on the most recent connection.
    pub fn observed_fingerprint(&self) -> Option<String> {
        self.pin.observed()
    }

    pub fn pinned_fingerprint(&self) -> Option<String> {
        self.pin.pinned()
    }

    fn mismatch_error(&self) -> Error {
        Error::FingerprintMismatch {
            pinned: self.pin.pinned().unwrap_or_default(),
            observed: self.pin.observed().unwrap_or_default(),
        }
    }

    /// Map a request failure, surfacing a fingerprint mismatch detected by
    /// the TLS verifier over the generic transport error.
    fn classify(&self, error: reqwest::Error) -> Error {
        if self.pin.is_poisoned() {
            self.mismatch_error()
        } else {
            Error::Transport(error.to_string())
        }
    }

    /// Guard every authenticated call: once a mismatch has been observed no
    /// further request is attempted.
    fn check_poisoned(&self) -> Result<()> {
        if self.pin.is_poisoned() {
            return Err(self.mismatch_error());
        }

        Ok(())
    }

    fn request(&self, endpoint: &str, body: &Value, keep_alive: bool) -> reqwest::RequestBuilder {
        let client = if keep_alive {
            &self.http_keep_alive
        } else {
            &self.http
        };

        let mut request = client
            .post(format!("{}{}", self.base, endpoint))
            .json(body);

        if keep_alive {
            request = request.header(CONNECTION, "keep-alive");
        }

        if let Some(token) = self.token() {
            request = request.header(TOKEN_HEADER, token);
        }

        request
    }

    /// Send a request and return `(status code, response body)`.
    ///
    /// Fails with `FingerprintMismatch` when the peer certificate hash
    /// differs from the pinned one, with `Transport` on any network, TLS or
    /// timeout failure.
    pub async fn send(&self, endpoint: &str, body: &Value, keep_alive: bool) -> Result<(u16, Vec<u8>)> {
        self.check_poisoned()?;

        let response = self
            .request(endpoint, body, keep_alive)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.classify(e))?
            .to_vec();

        self.verify_pin()?;

        Ok((status, bytes))
    }

    /// Send a request and parse the response body as JSON. An empty body is
    /// treated as an empty object rather than an error.
    pub async fn send_json(&self, endpoint: &str, body: &Value) -> Result<(u16, Value)> {
        let (status, bytes) = self.send(endpoint, body, false).await?;

        if bytes.is_empty() {
            return Ok((status, Value::Object(Default::default())));
        }

        let value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Protocol(format!("{}: {}", endpoint, e)))?;

        Ok((status, value))
    }

    /// Open the persistent event stream. Returns the raw byte stream once
    /// the server accepted the request with a 200.
    pub async fn open_stream(
        &self,
        endpoint: &str,
    ) -> Result<impl Stream<Item = reqwest::Result<bytes::Bytes>>> {
        self.check_poisoned()?;

        let response = self
            .request(endpoint, &Value::Object(Default::default()), true)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        self.verify_pin()?;

        if response.status().as_u16() != 200 {
            return Err(Error::UnexpectedStatus(response.status().as_u16()));
        }

        Ok(response.bytes_stream())
    }

    fn verify_pin(&self) -> Result<()> {
        if let (Some(pinned), Some(observed)) = (self.pin.pinned(), self.pin.observed()) {
            if pinned != observed {
                self.pin.poison();
                return Err(self.mismatch_error());
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pin_state(&self) -> Arc<PinState> {
        self.pin.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};
    use serde_json::json;

    async fn spawn_server() -> String {
        let server = HttpServer::new(|| {
            App::new()
                .route(
                    "/api/echo",
                    web::post().to(|body: web::Json<Value>| async move {
                        HttpResponse::Ok().json(json!({ "echo": body.into_inner() }))
                    }),
                )
                .route(
                    "/api/empty",
                    web::post().to(|| async { HttpResponse::Ok().finish() }),
                )
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());

        format!("http://{}", addr)
    }

    #[actix_web::test]
    async fn test_send_round_trip() {
        let base = spawn_server().await;
        let transport = Transport::with_base(base).unwrap();
        transport.set_token("secret".to_string());

        let (status, body) = transport
            .send_json("/api/echo", &json!({ "hello": "server" }))
            .await
            .unwrap();

        assert_eq!(status, 200);
        assert_eq!(body["echo"]["hello"], "server");
    }

    #[actix_web::test]
    async fn test_empty_body_is_empty_object() {
        let base = spawn_server().await;
        let transport = Transport::with_base(base).unwrap();

        let (status, body) = transport.send_json("/api/empty", &json!({})).await.unwrap();

        assert_eq!(status, 200);
        assert_eq!(body, json!({}));
    }

    #[actix_web::test]
    async fn test_poisoned_transport_refuses_requests() {
        let base = spawn_server().await;
        let transport = Transport::with_base(base).unwrap();

        transport.pin_state().pin("aa".repeat(32));
        transport.pin_state().record("bb".repeat(32));
        transport.pin_state().poison();

        let err = transport.send_json("/api/echo", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));
    }

    #[actix_web::test]
    async fn test_pin_divergence_detected_after_response() {
        let base = spawn_server().await;
        let transport = Transport::with_base(base).unwrap();

        // pinned at login, but a later connection presented something else
        transport.pin_fingerprint("aa".repeat(32));
        transport.pin_state().record("bb".repeat(32));

        let err = transport.send_json("/api/echo", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));

        // and no further authenticated call is attempted
        let err = transport.send_json("/api/echo", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));
    }
}
