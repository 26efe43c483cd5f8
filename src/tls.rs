// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # TLS for RabbitMQ Connections
//!
//! Builds the rustls client configuration used by the lapin transport when TLS
//! is enabled:
//!
//! - the protocol pin restricts the versions offered during the handshake;
//! - trust material (PEM certificates) replaces the bundled web PKI roots;
//! - key material (a PKCS#12 archive and its passphrase) enables mutual authentication;
//! - server certificate validation can be turned off for non-production brokers.
//!
//! Files are read with `tokio::fs`, never on the caller's blocking path.

use crate::{
    config::{TlsConfig, TlsProtocol},
    errors::AmqpError,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{
        pem::PemObject, CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
    },
    version::{TLS12, TLS13},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion,
};
use std::{path::Path, sync::Arc};
use tcp_stream::RustlsConnector;
use tracing::{debug, error, warn};

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Builds the connector performing the TLS handshake on top of the broker socket.
///
/// # Parameters
/// * `tls` - Validated TLS configuration; must be enabled.
///
/// # Returns
/// * `Result<RustlsConnector, AmqpError>` - The connector, or `TlsError` when the
///   material cannot be read or the configuration is rejected by rustls.
pub(crate) async fn rustls_connector(tls: &TlsConfig) -> Result<RustlsConnector, AmqpError> {
    Ok(RustlsConnector::from(client_config(tls).await?))
}

pub(crate) async fn client_config(tls: &TlsConfig) -> Result<ClientConfig, AmqpError> {
    let provider = Arc::new(ring::default_provider());
    let versions = protocol_versions(tls.protocol());
    debug!(protocol = tls.protocol().as_str(), "building tls configuration");

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|err| {
            error!(error = err.to_string(), "unsupported tls protocol version");
            AmqpError::TlsError(err.to_string())
        })?;

    let builder = if tls.validate_server_certificate() {
        builder.with_root_certificates(root_store(tls.trust_store()).await?)
    } else {
        warn!("server certificate validation is disabled, never use this in production");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
    };

    let identity = match tls.key_store() {
        Some(path) => Some(identity(path, tls).await?),
        None => None,
    };

    match identity {
        Some((chain, key)) => builder.with_client_auth_cert(chain, key).map_err(|err| {
            error!(error = err.to_string(), "client certificate rejected");
            AmqpError::TlsError(format!("key store: {err}"))
        }),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Versions offered in the handshake for a protocol pin.
pub(crate) fn protocol_versions(protocol: TlsProtocol) -> &'static [&'static SupportedProtocolVersion] {
    static ALL: [&SupportedProtocolVersion; 2] = [&TLS13, &TLS12];
    static V12: [&SupportedProtocolVersion; 1] = [&TLS12];
    static V13: [&SupportedProtocolVersion; 1] = [&TLS13];
    match protocol {
        TlsProtocol::Tls => &ALL,
        TlsProtocol::TlsV12 => &V12,
        TlsProtocol::TlsV13 => &V13,
    }
}

async fn root_store(trust_store: Option<&Path>) -> Result<RootCertStore, AmqpError> {
    let Some(path) = trust_store else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.into(),
        });
    };

    let pem = tokio::fs::read(path).await.map_err(|err| {
        error!(error = err.to_string(), path = ?path, "failure to read trust material");
        AmqpError::TlsError(format!("trust store: {err}"))
    })?;

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&pem) {
        let cert = cert.map_err(|err| {
            error!(error = err.to_string(), path = ?path, "invalid trust material");
            AmqpError::TlsError(format!("trust store: {err}"))
        })?;
        roots.add(cert).map_err(|err| {
            error!(error = err.to_string(), path = ?path, "invalid trust certificate");
            AmqpError::TlsError(format!("trust store: {err}"))
        })?;
    }

    if roots.is_empty() {
        error!(path = ?path, "no certificate in trust material");
        return Err(AmqpError::TlsError("trust store: no certificate".to_owned()));
    }

    Ok(roots)
}

async fn identity(path: &Path, tls: &TlsConfig) -> Result<Identity, AmqpError> {
    let der = tokio::fs::read(path).await.map_err(|err| {
        error!(error = err.to_string(), path = ?path, "failure to read key material");
        AmqpError::TlsError(format!("key store: {err}"))
    })?;
    let password = tls
        .key_store_password()
        .map(|secret| secret.expose())
        .unwrap_or_default();

    let keystore = p12_keystore::KeyStore::from_pkcs12(&der, password).map_err(|err| {
        error!(error = err.to_string(), path = ?path, "failure to open key material");
        AmqpError::TlsError(format!("key store: {err}"))
    })?;

    let Some((_, chain)) = keystore.private_key_chain() else {
        error!(path = ?path, "no private key in key material");
        return Err(AmqpError::TlsError("key store: no private key".to_owned()));
    };

    let certs = chain
        .chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(chain.key().to_vec()));

    Ok((certs, key))
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
pub(crate) struct AcceptAnyServerCert(Arc<CryptoProvider>);

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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
