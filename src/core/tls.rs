/// Transport-encryption upgrade seam.
///
/// The negotiation handshake (probe bytes, accept/refuse) lives in
/// `core::connect` and `core::session`; the upgrade mechanics themselves are
/// an external collaborator behind this trait. Deployments wire in a real
/// TLS provider; `NoUpgrade` is the shipped default and refuses every
/// upgrade with an explicit error.
use async_trait::async_trait;

use crate::core::connect::ProxyStream;
use crate::error::{ProxyError, ProxyResult};

#[async_trait]
pub trait StreamUpgrader: Send + Sync {
    /// Client half of the TLS handshake, run against a backend that
    /// accepted the SSL request.
    async fn upgrade_backend(&self, stream: ProxyStream, host: &str) -> ProxyResult<ProxyStream>;

    /// Server half of the TLS handshake, run against a client the proxy
    /// just sent the acceptance byte to.
    async fn upgrade_client(&self, stream: ProxyStream) -> ProxyResult<ProxyStream>;
}

/// Refuses every upgrade. With SSL disabled in the configuration this is
/// never invoked; with SSL enabled it turns a missing TLS provider into a
/// hard error instead of silent plaintext.
pub struct NoUpgrade;

#[async_trait]
impl StreamUpgrader for NoUpgrade {
    async fn upgrade_backend(&self, _stream: ProxyStream, host: &str) -> ProxyResult<ProxyStream> {
        Err(ProxyError::tls(format!(
            "no TLS provider configured for backend upgrade to {}",
            host
        )))
    }

    async fn upgrade_client(&self, _stream: ProxyStream) -> ProxyResult<ProxyStream> {
        Err(ProxyError::tls("no TLS provider configured for client upgrade"))
    }
}
