use camino::Utf8PathBuf;
use rumqttc::tokio_rustls::rustls;

/// An MQTT link related error
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("Invalid topic filter: {pattern:?}")]
    InvalidFilter { pattern: String },

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Failed to read TLS material from {path}: {source}")]
    CertificateIo {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("No PEM-encoded private key found in {path}")]
    NoPrivateKey { path: Utf8PathBuf },

    #[error("A client certificate requires a client key, and vice versa")]
    IncompleteClientAuth,

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}
