use crate::errors::LinkError;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use rumqttc::tokio_rustls::rustls;
use rumqttc::tokio_rustls::rustls::client::danger::HandshakeSignatureValid;
use rumqttc::tokio_rustls::rustls::client::danger::ServerCertVerified;
use rumqttc::tokio_rustls::rustls::client::danger::ServerCertVerifier;
use rumqttc::tokio_rustls::rustls::pki_types::CertificateDer;
use rumqttc::tokio_rustls::rustls::pki_types::PrivateKeyDer;
use rumqttc::tokio_rustls::rustls::pki_types::ServerName;
use rumqttc::tokio_rustls::rustls::pki_types::UnixTime;
use rumqttc::tokio_rustls::rustls::DigitallySignedStruct;
use rumqttc::tokio_rustls::rustls::SignatureScheme;
use rumqttc::MqttOptions;
use rumqttc::TlsConfiguration;
use rumqttc::Transport;
use std::sync::Arc;
use std::time::Duration;

/// Configuration of the connection to the cloud broker.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Broker host to connect to.
    ///
    /// Default: "localhost"
    pub host: String,

    /// Broker port.
    ///
    /// Default: 8883
    pub port: u16,

    /// Client id; also names the persistent broker session, so the broker
    /// keeps the subscription state across reconnects.
    pub client_id: String,

    /// Username/password credentials, when the broker requires them.
    pub credentials: Option<Credentials>,

    /// TLS settings; `None` connects in the clear.
    pub tls: Option<TlsSettings>,

    /// Bounds for the reconnect backoff.
    pub backoff: Backoff,

    /// Capacity of the request queue between the client handle and the
    /// event loop.
    ///
    /// Default: 64
    pub queue_capacity: usize,

    /// MQTT keep-alive interval.
    ///
    /// Default: 60 s
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// TLS material locations and verification policy.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM file with the broker CA chain; the webpki roots are used when
    /// absent.
    pub ca_cert: Option<Utf8PathBuf>,

    /// PEM files for mutual TLS; either both or neither.
    pub client_cert: Option<Utf8PathBuf>,
    pub client_key: Option<Utf8PathBuf>,

    /// Skip certificate chain and hostname verification.
    pub danger_accept_invalid_certs: bool,
}

/// Reconnect delay bounds: the delay starts at `base`, doubles on every
/// failed attempt and is capped at `max`; a successful connection resets it.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn advance(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(32),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            host: String::from("localhost"),
            port: 8883,
            client_id: String::from("vineguard-gateway"),
            credentials: None,
            tls: None,
            backoff: Backoff::default(),
            queue_capacity: 64,
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl LinkConfig {
    /// Set a custom host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set a custom port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the client id (and thereby the broker session name)
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set username/password credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Enable TLS with the given settings
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the reconnect backoff bounds
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff { base, max };
        self
    }

    /// Wrap this config into the set of options expected by rumqttc.
    ///
    /// The session is never clean: the broker keeps the subscription state
    /// for the client id while the gateway is away.
    pub fn rumqttc_options(&self) -> Result<MqttOptions, LinkError> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_clean_session(false);
        options.set_keep_alive(self.keep_alive);

        if let Some(credentials) = &self.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }

        if let Some(tls) = &self.tls {
            options.set_transport(Transport::tls_with_config(tls.to_tls_configuration()?));
        }

        Ok(options)
    }
}

impl TlsSettings {
    fn to_tls_configuration(&self) -> Result<TlsConfiguration, LinkError> {
        let builder = rustls::ClientConfig::builder();

        let builder = if self.danger_accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };

        let config = match self.client_auth()? {
            Some((cert_chain, key)) => builder.with_client_auth_cert(cert_chain, key)?,
            None => builder.with_no_client_auth(),
        };

        Ok(TlsConfiguration::Rustls(Arc::new(config)))
    }

    fn root_store(&self) -> Result<rustls::RootCertStore, LinkError> {
        let mut roots = rustls::RootCertStore::empty();
        match &self.ca_cert {
            Some(path) => {
                for cert in rustls_pemfile::certs(&mut read_pem(path)?.as_slice()) {
                    roots.add(cert.map_err(|source| LinkError::CertificateIo {
                        path: path.clone(),
                        source,
                    })?)?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        Ok(roots)
    }

    #[allow(clippy::type_complexity)]
    fn client_auth(
        &self,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, LinkError> {
        let (cert_path, key_path) = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => (cert, key),
            (None, None) => return Ok(None),
            _ => return Err(LinkError::IncompleteClientAuth),
        };

        let cert_chain = rustls_pemfile::certs(&mut read_pem(cert_path)?.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| LinkError::CertificateIo {
                path: cert_path.clone(),
                source,
            })?;

        let key = rustls_pemfile::private_key(&mut read_pem(key_path)?.as_slice())
            .map_err(|source| LinkError::CertificateIo {
                path: key_path.clone(),
                source,
            })?
            .ok_or_else(|| LinkError::NoPrivateKey {
                path: key_path.clone(),
            })?;

        Ok(Some((cert_chain, key)))
    }
}

fn read_pem(path: &Utf8Path) -> Result<Vec<u8>, LinkError> {
    std::fs::read(path).map_err(|source| LinkError::CertificateIo {
        path: path.to_owned(),
        source,
    })
}

/// Certificate verifier that accepts any broker certificate.
///
/// Installed only when the operator explicitly opts out of verification;
/// both the chain and the hostname checks are skipped.
#[derive(Debug)]
struct AcceptAnyServerCert;

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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
