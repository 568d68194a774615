// This file is part of Astarte.
//
// Copyright 2021 - 2025 SECO Mind Srl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Mutual-TLS socket setup: builds a [`rustls::ClientConfig`] from the paired client
//! certificate/key plus a trust anchor, and wraps a blocking [`TcpStream`] in it.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        // Ignore the error: a prior call (e.g. from reqwest's rustls backend) may have already
        // installed a provider, which is fine as long as it's this one.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Error building the TLS socket.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to connect the underlying TCP socket")]
    Connect(#[source] io::Error),
    #[error("could not parse the client certificate chain")]
    ClientCertificate,
    #[error("could not parse the client private key")]
    ClientKey,
    #[error("could not load the native trust store")]
    NativeRoots,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error("could not set the socket read timeout")]
    SetReadTimeout(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The client identity used for mutual TLS: PEM-encoded certificate chain and private key, as
/// returned by the pairing collaborator and [`crate::crypto::generate_csr`].
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub certificate_chain_pem: String,
    pub private_key_pem: String,
}

/// How to validate the broker's server certificate.
#[derive(Debug, Clone)]
pub enum TrustAnchor {
    /// The platform's native trust store (via `rustls-native-certs`).
    Native,
    /// The bundled Mozilla CA set (requires the `webpki` feature).
    #[cfg(feature = "webpki")]
    WebpkiRoots,
    /// A single PEM-encoded CA certificate, e.g. for a self-hosted Astarte instance.
    Custom(String),
    /// Accept any server certificate. Development escape hatch only.
    InsecureSkipVerify,
}

fn parse_certificate_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TlsError::ClientCertificate)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|_| TlsError::ClientKey)?
        .ok_or(TlsError::ClientKey)
}

fn root_store(anchor: &TrustAnchor) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();

    match anchor {
        TrustAnchor::Native => {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                tracing::warn!(%err, "error loading a native root certificate");
            }
            for cert in native.certs {
                // Ignore certificates the store can't parse rather than failing outright, same
                // policy rustls-native-certs itself documents.
                let _ = store.add(cert);
            }
        }
        #[cfg(feature = "webpki")]
        TrustAnchor::WebpkiRoots => {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TrustAnchor::Custom(pem) => {
            let certs = parse_certificate_chain(pem)?;
            for cert in certs {
                store.add(cert).map_err(|_| TlsError::ClientCertificate)?;
            }
        }
        TrustAnchor::InsecureSkipVerify => {}
    }

    Ok(store)
}

#[derive(Debug)]
struct NoServerVerification(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn build_client_config(identity: &ClientIdentity, anchor: &TrustAnchor) -> Result<ClientConfig, TlsError> {
    ensure_crypto_provider();

    let certs = parse_certificate_chain(&identity.certificate_chain_pem)?;
    let key = parse_private_key(&identity.private_key_pem)?;

    let builder = ClientConfig::builder();

    let mut config = if matches!(anchor, TrustAnchor::InsecureSkipVerify) {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification((*provider).clone())))
            .with_client_auth_cert(certs, key)?
    } else {
        let roots = root_store(anchor)?;
        builder
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?
    };

    config.enable_sni = true;

    Ok(config)
}

/// A blocking TLS connection over a TCP socket, carrying MQTT bytes in both directions.
pub struct TlsSocket(StreamOwned<ClientConnection, TcpStream>);

impl TlsSocket {
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        identity: &ClientIdentity,
        anchor: &TrustAnchor,
    ) -> Result<Self, TlsError> {
        let config = build_client_config(identity, anchor)?;

        let server_name = ServerName::try_from(host.to_owned()).map_err(|_| TlsError::ClientCertificate)?;
        let conn = ClientConnection::new(Arc::new(config), server_name)?;

        let addr = (host, port)
            .to_socket_addrs_first()
            .map_err(TlsError::Connect)?;
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(TlsError::Connect)?;
        tcp.set_nodelay(true).map_err(TlsError::Connect)?;

        Ok(Self(StreamOwned::new(conn, tcp)))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TlsError> {
        self.0.sock.set_read_timeout(timeout).map_err(TlsError::SetReadTimeout)
    }
}

impl Read for TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for TlsSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

trait ToSocketAddrFirst {
    fn to_socket_addrs_first(&self) -> io::Result<std::net::SocketAddr>;
}

impl ToSocketAddrFirst for (&str, u16) {
    fn to_socket_addrs_first(&self) -> io::Result<std::net::SocketAddr> {
        use std::net::ToSocketAddrs;

        self.to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "DNS resolution returned no addresses"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_to_an_unreachable_host_fails_fast() {
        let identity = ClientIdentity {
            certificate_chain_pem: String::new(),
            private_key_pem: String::new(),
        };

        // An empty PEM can't be parsed into a certificate chain, so this exercises the
        // certificate-parsing error path without needing a live broker.
        let err = TlsSocket::connect(
            "127.0.0.1",
            1,
            Duration::from_millis(100),
            &identity,
            &TrustAnchor::InsecureSkipVerify,
        )
        .unwrap_err();

        assert!(matches!(err, TlsError::ClientCertificate));
    }
}
