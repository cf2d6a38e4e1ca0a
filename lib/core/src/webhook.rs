use hmac::{Hmac, Mac};
use log::warn;
use sha2::Sha256;

use crate::error::OrchestratorError;

type HmacSha256 = Hmac<Sha256>;

/// Verifies HMAC-SHA256 webhook signatures for one provider
///
/// The signature is the hex encoded HMAC of the raw payload, optionally
/// prefixed with `sha256=`. Comparison is constant time.
#[derive(Clone)]
pub struct WebhookVerifier {
    provider: String,
    secret: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(provider: &str, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            provider: provider.to_string(),
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, OrchestratorError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| OrchestratorError::GenericError(format!("Invalid webhook secret: {e}")))
    }

    /// Hex encoded signature of `payload`
    pub fn sign(&self, payload: &[u8]) -> Result<String, OrchestratorError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Fails closed on an empty secret, a malformed header or a mismatch
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<(), OrchestratorError> {
        if self.secret.is_empty() {
            warn!("{}: webhook secret is not configured", self.provider);
            return Err(OrchestratorError::InvalidSignature);
        }
        let signature = signature.trim();
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hex::decode(signature).map_err(|_| {
            warn!("{}: webhook signature is not valid hex", self.provider);
            OrchestratorError::InvalidSignature
        })?;

        let mut mac = self.mac()?;
        mac.update(payload);
        mac.verify_slice(&expected).map_err(|_| {
            warn!("{}: webhook signature mismatch", self.provider);
            OrchestratorError::InvalidSignature
        })
    }
}
