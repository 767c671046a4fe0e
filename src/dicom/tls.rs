//! # DICOM Upper Layer TLS
//!
//! The association is TCP by default; when a channel configures a PKCS#12
//! keystore (per the external-interfaces contract: "TLS optional with PKCS#12
//! keystore and CA truststore"), the accept/connect paths wrap the socket in a
//! TLS session instead. `native-tls` is used rather than `rustls` specifically
//! because it loads PKCS#12 identities directly (`Identity::from_pkcs12`)
//! without a separate PEM conversion step, matching the keystore format the
//! interface names.

use crate::error::{EngineError, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::{native_tls, TlsAcceptor, TlsConnector, TlsStream};

/// A loaded PKCS#12 keystore plus an optional CA truststore, read once at
/// connector construction time.
#[derive(Clone)]
pub struct DicomTlsConfig {
    identity: native_tls::Identity,
    trusted_ca: Option<native_tls::Certificate>,
}

impl DicomTlsConfig {
    /// Load a PKCS#12 keystore (`.p12`/`.pfx`) and, optionally, a DER or PEM CA
    /// certificate used as the sole trust anchor for the peer's certificate.
    pub fn from_files(pkcs12_path: &str, pkcs12_password: &str, ca_truststore_path: Option<&str>) -> Result<Self> {
        let pkcs12_bytes = std::fs::read(pkcs12_path).map_err(|e| EngineError::Validation(format!("failed to read DICOM TLS keystore {pkcs12_path}: {e}")))?;
        let identity = native_tls::Identity::from_pkcs12(&pkcs12_bytes, pkcs12_password)
            .map_err(|e| EngineError::Validation(format!("invalid PKCS#12 keystore {pkcs12_path}: {e}")))?;

        let trusted_ca = ca_truststore_path
            .map(|path| {
                let bytes = std::fs::read(path).map_err(|e| EngineError::Validation(format!("failed to read DICOM CA truststore {path}: {e}")))?;
                native_tls::Certificate::from_pem(&bytes)
                    .or_else(|_| native_tls::Certificate::from_der(&bytes))
                    .map_err(|e| EngineError::Validation(format!("invalid CA truststore {path}: {e}")))
            })
            .transpose()?;

        Ok(Self { identity, trusted_ca })
    }

    pub(super) fn build_acceptor(&self) -> Result<TlsAcceptor> {
        let acceptor = native_tls::TlsAcceptor::new(self.identity.clone()).map_err(|e| EngineError::Internal(format!("failed to build DICOM TLS acceptor: {e}")))?;
        Ok(TlsAcceptor::from(acceptor))
    }

    pub(super) fn build_connector(&self) -> Result<TlsConnector> {
        let mut builder = native_tls::TlsConnector::builder();
        builder.identity(self.identity.clone());
        if let Some(ca) = &self.trusted_ca {
            builder.add_root_certificate(ca.clone());
            // A private CA truststore is the sole trust anchor for the peer AE;
            // the platform's public root store has no bearing on an internal
            // DICOM link.
            builder.disable_built_in_roots(true);
        }
        let connector = builder.build().map_err(|e| EngineError::Internal(format!("failed to build DICOM TLS connector: {e}")))?;
        Ok(TlsConnector::from(connector))
    }
}

/// A DICOM association socket, plain or TLS-wrapped. `Framed` only needs
/// `AsyncRead + AsyncWrite`, so this enum delegates to whichever variant is
/// live rather than forcing both code paths to share a trait object.
pub enum DicomStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DicomStream {
    pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<Self> {
        let tls = acceptor.accept(stream).await.map_err(|e| EngineError::Protocol(format!("DICOM TLS handshake failed: {e}")))?;
        Ok(DicomStream::Tls(Box::new(tls)))
    }

    pub async fn connect(connector: &TlsConnector, domain: &str, stream: TcpStream) -> Result<Self> {
        let tls = connector.connect(domain, stream).await.map_err(|e| EngineError::Protocol(format!("DICOM TLS handshake failed: {e}")))?;
        Ok(DicomStream::Tls(Box::new(tls)))
    }
}

impl From<TcpStream> for DicomStream {
    fn from(stream: TcpStream) -> Self {
        DicomStream::Plain(stream)
    }
}

impl AsyncRead for DicomStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DicomStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DicomStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DicomStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            DicomStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DicomStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DicomStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DicomStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DicomStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DicomStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keystore_file_is_a_validation_error() {
        let err = DicomTlsConfig::from_files("/nonexistent/keystore.p12", "changeit", None).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn missing_truststore_file_is_a_validation_error() {
        let err = DicomTlsConfig::from_files("/nonexistent/keystore.p12", "changeit", Some("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
