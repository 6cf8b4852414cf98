use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, Error as TlsError, ServerName};
use sha2::{Digest, Sha256};

/// Shared pinning state between the transport and the TLS verifier.
///
/// `observed` always holds the fingerprint of the most recent peer leaf
/// certificate; `pinned` is set once after a successful login. A mismatch
/// latches `poisoned` so the transport can refuse further calls.
pub struct PinState {
    pinned: Mutex<Option<String>>,
    observed: Mutex<Option<String>>,
    poisoned: AtomicBool,
}

impl PinState {
    pub fn new() -> Self {
        PinState {
            pinned: Mutex::new(None),
            observed: Mutex::new(None),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn pin(&self, fingerprint: String) {
        *self.pinned.lock().unwrap() = Some(fingerprint);
    }

    pub fn pinned(&self) -> Option<String> {
        self.pinned.lock().unwrap().clone()
    }

    pub fn observed(&self) -> Option<String> {
        self.observed.lock().unwrap().clone()
    }

    pub fn record(&self, fingerprint: String) {
        *self.observed.lock().unwrap() = Some(fingerprint);
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }
}

impl Default for PinState {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Certificate verifier implementing the fingerprint-pinning trust model.
///
/// Chain validation is intentionally disabled: the team server presents a
/// self-signed certificate and trust is established by the operator
/// confirming its fingerprint at login, not by CA validation.
pub struct PinVerifier {
    state: Arc<PinState>,
}

impl PinVerifier {
    pub fn new(state: Arc<PinState>) -> Self {
        PinVerifier { state }
    }
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        let observed = fingerprint(&end_entity.0);
        self.state.record(observed.clone());

        if let Some(pinned) = self.state.pinned() {
            if pinned != observed {
                self.state.poison();
                log::error!(
                    "invalid ssl fingerprint detected ({}), refusing connection",
                    observed
                );
                return Err(TlsError::General(
                    "pinned certificate fingerprint mismatch".to_string(),
                ));
            }
        }

        Ok(ServerCertVerified::assertion())
    }
}
