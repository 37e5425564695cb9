use std::sync::Arc;

use rustls::pki_types::ServerName;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::error::NetError;
use super::url::{HubUrl, Scheme};
use crate::protocol::Session;

/// Dials a hub, wrapping the stream in TLS for `adcs://`.
///
/// Server certificates are accepted opportunistically; when the URL
/// carries a `kp=SHA256/...` keyprint the first certificate's digest
/// must match it, checked before any protocol byte is exchanged.
pub async fn dial(url: &HubUrl) -> Result<Session, NetError> {
    let stream = TcpStream::connect((url.host.as_str(), url.port)).await?;

    match url.scheme {
        Scheme::Adc => Ok(Session::new(Box::new(stream))),
        Scheme::Adcs => {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(url.host.clone())
                .map_err(|_| NetError::InvalidUrl(url.host.clone()))?;

            let tls = connector.connect(server_name, stream).await?;

            if let Some(expected) = &url.keyprint {
                let (_, connection) = tls.get_ref();
                let matched = connection
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|cert| keyprint_matches(expected, cert.as_ref()))
                    .unwrap_or(false);
                if !matched {
                    return Err(NetError::Keyprint);
                }
            }

            Ok(Session::new(Box::new(tls)))
        }
    }
}

pub(super) fn keyprint_matches(expected: &[u8; 32], cert_der: &[u8]) -> bool {
    let digest: [u8; 32] = Sha256::digest(cert_der).into();
    &digest == expected
}

/// Accepts any server certificate. Hubs run self-signed certificates as
/// a rule; trust comes from the out-of-band keyprint when one is given.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
