//! TLS configuration for both tunnel roles
//!
//! Both sides use a rustls crypto provider cut down to AES-256-GCM suites and
//! NIST curves, TLS 1.2 minimum. The server prefers its own suite order.

use crate::config::TlsConfig;
use anyhow::{anyhow, Context};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Crypto provider restricted to the tunnel's cipher suite allow-list.
///
/// Suites: TLS 1.3 AES-256-GCM-SHA384 and TLS 1.2 ECDHE-RSA AES-256-GCM-SHA384.
/// Key exchange: P-384, then P-256.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        kx_groups: vec![ring::kx_group::SECP384R1, ring::kx_group::SECP256R1],
        ..ring::default_provider()
    })
}

const PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Load a PEM certificate chain
pub fn load_certs(path: impl AsRef<Path>) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificate found in {}", path.display()));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#1, PKCS#8 or SEC1)
pub fn load_private_key(path: impl AsRef<Path>) -> anyhow::Result<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open private key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key {}", path.display()))?
        .with_context(|| format!("No private key found in {}", path.display()))
}

/// Generate a self-signed certificate for `localhost`
pub fn generate_self_signed_cert(
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)?;

    let cert_der = certified_key.cert.der().clone();
    let key_der = certified_key.key_pair.serialize_der();

    Ok((vec![cert_der], PrivateKeyDer::Pkcs8(key_der.into())))
}

/// Build the listener's TLS configuration.
///
/// A configured certificate pair that cannot be loaded is an error. Without
/// any configured pair a throwaway self-signed certificate is generated, but
/// only when `self_signed` is set.
pub fn server_config(tls: &TlsConfig) -> anyhow::Result<ServerConfig> {
    let (cert_chain, key_der) = match (tls.cert_path.as_deref(), tls.key_path.as_deref()) {
        (Some(cert), Some(key)) => {
            let chain = load_certs(cert)?;
            let key = load_private_key(key)?;
            info!("Loaded TLS certificate from {}", cert);
            (chain, key)
        }
        (None, None) if tls.self_signed => {
            warn!("No TLS certificate configured, generating a self-signed certificate");
            generate_self_signed_cert()?
        }
        (None, None) => return Err(anyhow!("No TLS certificate configured")),
        _ => {
            return Err(anyhow!(
                "TLS certificate and private key paths must be configured together"
            ))
        }
    };

    let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key_der)
        .context("Failed to create TLS config")?;

    server_config.ignore_client_order = true;

    Ok(server_config)
}

/// Build the dialer's TLS configuration
pub fn client_config(tls: &TlsConfig) -> anyhow::Result<ClientConfig> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .context("Failed to select TLS protocol versions")?;

    if tls.insecure_skip_verify {
        warn!("SKIPPING CERTIFICATE VERIFICATION - This is insecure!");
        let verifier = AcceptAnyServerCert {
            algorithms: provider.signature_verification_algorithms,
        };
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth());
    }

    let mut root_store = RootCertStore::empty();
    match tls.ca_path.as_deref() {
        Some(ca) => {
            for cert in load_certs(ca)? {
                root_store
                    .add(cert)
                    .with_context(|| format!("Failed to add trust anchor from {}", ca))?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs()? {
                root_store
                    .add(cert)
                    .map_err(|_| anyhow!("Failed to add root cert"))?;
            }
        }
    }

    Ok(builder
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Server name to present, from the SNI override or the dialed host
pub fn server_name(tls: &TlsConfig, server_addr: &str) -> anyhow::Result<ServerName<'static>> {
    let host = match tls.sni.as_deref() {
        Some(sni) => sni,
        None => server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .ok_or_else(|| anyhow!("Invalid server address format. Expected 'host:port'"))?,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("Invalid server name: {:?}", e))
}

/// Verifier that accepts any certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
