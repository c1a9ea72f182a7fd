// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TLS session setup, shared by direct SSL and the mid-stream upgrade.

use native_tls::{Certificate, Identity, TlsConnector as NativeTlsConnector};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_native_tls::{TlsConnector, TlsStream};

use crate::config::StreamConfig;
use crate::Error;

fn build_connector(config: &StreamConfig) -> Result<TlsConnector, Error> {
    let mut builder = NativeTlsConnector::builder();
    if let Some(path) = &config.ca_certs {
        let pem = std::fs::read(path)?;
        builder.add_root_certificate(Certificate::from_pem(&pem)?);
    }
    if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
        let cert_pem = std::fs::read(cert)?;
        let key_pem = std::fs::read(key)?;
        builder.identity(Identity::from_pkcs8(&cert_pem, &key_pem)?);
    }
    if config.cert_verifier.is_some() {
        // The pluggable verifier is the authority instead of the backend.
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    Ok(TlsConnector::from(builder.build()?))
}

/// Performs the TLS handshake over an established transport and extracts
/// the peer certificate for the pluggable verification step.
pub(crate) async fn wrap<S>(
    socket: S,
    config: &StreamConfig,
) -> Result<(TlsStream<S>, Option<Vec<u8>>), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connector = build_connector(config)?;
    let stream = connector.connect(&config.domain, socket).await?;
    let peer_der = match stream.get_ref().peer_certificate()? {
        Some(cert) => Some(cert.to_der()?),
        None => None,
    };
    Ok((stream, peer_der))
}
