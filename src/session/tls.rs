//! TLS session implementation

use async_trait::async_trait;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::common::{Result, Stream};
use crate::error::Error;

use super::Session;

/// TLS configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for SNI
    pub server_name: Option<String>,
    /// Allow insecure certificates
    pub allow_insecure: bool,
    /// Certificate file path (for server)
    pub certificate_file: Option<String>,
    /// Private key file path (for server)
    pub key_file: Option<String>,
}

/// TLS session for encrypting the tunnel stream
pub struct TlsSession {
    config: TlsConfig,
    connector: TlsConnector,
    acceptor: Option<TlsAcceptor>,
}

impl TlsSession {
    pub fn new(config: TlsConfig) -> Self {
        let connector = Self::build_connector(&config);
        let acceptor = Self::build_acceptor(&config);
        Self {
            config,
            connector,
            acceptor,
        }
    }

    fn build_connector(config: &TlsConfig) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if config.allow_insecure {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCert));
        }

        TlsConnector::from(Arc::new(tls_config))
    }

    fn build_acceptor(config: &TlsConfig) -> Option<TlsAcceptor> {
        let cert_file = config.certificate_file.as_ref()?;
        let key_file = config.key_file.as_ref()?;

        let certs = Self::load_certs(cert_file).ok()?;
        let key = Self::load_private_key(key_file).ok()?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .ok()?;

        Some(TlsAcceptor::from(Arc::new(server_config)))
    }

    fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("Failed to open certificate file {}: {}", path, e))
        })?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("Failed to parse certificates: {}", e)))?;
        Ok(certs)
    }

    fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("Failed to open key file {}: {}", path, e)))?;
        let mut reader = BufReader::new(file);

        let keys = rustls_pemfile::read_all(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("Failed to parse private key: {}", e)))?;

        for item in keys {
            match item {
                rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
                rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
                rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
                _ => continue,
            }
        }

        Err(Error::Config("No valid private key found in file".into()))
    }
}

#[async_trait]
impl Session for TlsSession {
    async fn wrap_client(&self, stream: Stream) -> Result<Stream> {
        let server_name = self
            .config
            .server_name
            .as_ref()
            .ok_or_else(|| Error::Config("TLS server name required".into()))?;

        let domain = ServerName::try_from(server_name.clone())
            .map_err(|_| Error::Config(format!("Invalid server name: {}", server_name)))?;

        // A boxed Stream is itself AsyncRead + AsyncWrite, so it feeds
        // straight into the connector.
        let tls_stream = self.connector.connect(domain, stream).await?;
        Ok(Box::new(tls_stream))
    }

    async fn wrap_server(&self, stream: Stream) -> Result<Stream> {
        let acceptor = self.acceptor.as_ref().ok_or_else(|| {
            Error::Config("TLS server requires certificate_file and key_file".into())
        })?;

        let tls_stream = acceptor.accept(stream).await?;
        Ok(Box::new(tls_stream))
    }
}

/// Certificate verifier that waves every peer through. Only reachable via
/// `allow_insecure`, for lab setups with self-signed tunnel endpoints.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        use SignatureScheme::*;
        vec![
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ED25519,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
        ]
    }
}
