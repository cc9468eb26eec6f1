use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{net::TcpStream, time};
use tokio_rustls::TlsConnector;

use crate::viaduct::net::Destination;

/// Read+write transport behind one object-safe trait, so dialers can hand
/// back plain TCP, TLS sessions and h2 tunnel wrappers as the same boxed
/// type.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// A dialed upstream transport plus the application protocol negotiated on it.
///
/// `alpn` is `None` for plain TCP and for TLS sessions where the peer selected
/// nothing; the negotiator treats both as HTTP/1.1.
pub struct DialedConn {
    pub stream: BoxedStream,
    pub alpn: Option<String>,
}

impl DialedConn {
    pub fn alpn_str(&self) -> &str {
        self.alpn.as_deref().unwrap_or("")
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dest: &Destination) -> anyhow::Result<DialedConn>;
}

/// Plain TCP dialer.
pub struct TcpDialer {
    dial_timeout: Duration,
}

impl TcpDialer {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, dest: &Destination) -> anyhow::Result<DialedConn> {
        let c = dial_tcp(dest, self.dial_timeout).await?;
        Ok(DialedConn {
            stream: Box::new(c),
            alpn: None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsDialerOptions {
    /// SNI override; empty means "use the dialed host".
    pub server_name: String,
    pub insecure_skip_verify: bool,
    /// ALPN protocols to offer, in preference order.
    pub alpn: Vec<String>,
    /// Optional PEM bundle of additional trust anchors.
    pub ca_file: String,
}

/// TLS dialer: completes the handshake and surfaces the negotiated ALPN.
pub struct TlsDialer {
    dial_timeout: Duration,
    server_name: String,
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new(dial_timeout: Duration, opts: TlsDialerOptions) -> anyhow::Result<Self> {
        let cfg = tls::client_config(&opts)?;
        Ok(Self {
            dial_timeout,
            server_name: opts.server_name.trim().to_string(),
            connector: TlsConnector::from(Arc::new(cfg)),
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, dest: &Destination) -> anyhow::Result<DialedConn> {
        let c = dial_tcp(dest, self.dial_timeout).await?;

        let name = if self.server_name.is_empty() {
            dest.host.clone()
        } else {
            self.server_name.clone()
        };
        let sn = rustls::pki_types::ServerName::try_from(name.clone())
            .with_context(|| format!("invalid TLS server name {name:?}"))?;

        let tls = self
            .connector
            .connect(sn, c)
            .await
            .with_context(|| format!("tls handshake with {dest}"))?;

        let alpn = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());

        Ok(DialedConn {
            stream: Box::new(tls),
            alpn,
        })
    }
}

async fn dial_tcp(dest: &Destination, timeout: Duration) -> anyhow::Result<TcpStream> {
    let addr = dest.authority();
    let c = if timeout > Duration::from_millis(0) {
        time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))??
    } else {
        TcpStream::connect(&addr).await?
    };
    Ok(c)
}

mod tls {
    use std::{fs, sync::Arc};

    use anyhow::Context;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    use super::TlsDialerOptions;

    pub fn client_config(opts: &TlsDialerOptions) -> anyhow::Result<rustls::ClientConfig> {
        let alpn: Vec<Vec<u8>> = opts
            .alpn
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        if opts.insecure_skip_verify {
            let mut cfg = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_no_client_auth();
            cfg.alpn_protocols = alpn;
            return Ok(cfg);
        }

        let mut root =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if !opts.ca_file.is_empty() {
            for cert in load_certs(&opts.ca_file)? {
                root.add(cert)
                    .with_context(|| format!("tls: add CA from {}", opts.ca_file))?;
            }
        }

        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(root)
            .with_no_client_auth();
        cfg.alpn_protocols = alpn;
        Ok(cfg)
    }

    fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path).with_context(|| format!("tls: read {path}"))?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("tls: parse {path}"))?;
        Ok(certs)
    }

    /// Verifier behind the `insecure_skip_verify` switch: trusts whatever
    /// certificate the upstream presents (handshake signatures are still
    /// checked). Anyone on the path can impersonate the proxy, so this is
    /// for lab upstreams with self-signed certificates, nothing else.
    #[derive(Debug)]
    struct AcceptAnyServerCert {
        algs: rustls::crypto::WebPkiSupportedAlgorithms,
    }

    impl AcceptAnyServerCert {
        fn new() -> Self {
            Self {
                algs: rustls::crypto::ring::default_provider().signature_verification_algorithms,
            }
        }
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
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.algs.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::{io::AsyncReadExt, net::TcpListener};
    use tokio_rustls::TlsAcceptor;

    use super::*;
    use crate::viaduct::net::Destination;

    fn test_acceptor(alpn: &[&str]) -> TlsAcceptor {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(["localhost".to_string()]).unwrap();
        let cert_der = cert.der().clone();
        let key_der =
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

        let mut cfg = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        cfg.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        TlsAcceptor::from(Arc::new(cfg))
    }

    #[tokio::test]
    async fn tcp_dialer_has_no_alpn() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let _ = ln.accept().await.unwrap();
        });

        let d = TcpDialer::new(Duration::from_secs(2));
        let conn = d
            .dial(&Destination::tcp("127.0.0.1", addr.port()))
            .await
            .unwrap();
        assert!(conn.alpn.is_none());
        assert_eq!(conn.alpn_str(), "");

        accept.await.unwrap();
    }

    #[tokio::test]
    async fn tls_dialer_surfaces_negotiated_alpn() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let acceptor = test_acceptor(&["h2"]);

        let server = tokio::spawn(async move {
            let (c, _) = ln.accept().await.unwrap();
            let mut tls = acceptor.accept(c).await.unwrap();
            // Hold the session open until the client hangs up.
            let mut buf = [0u8; 1];
            let _ = tls.read(&mut buf).await;
        });

        let d = TlsDialer::new(
            Duration::from_secs(2),
            TlsDialerOptions {
                server_name: "localhost".into(),
                insecure_skip_verify: true,
                alpn: vec!["h2".into(), "http/1.1".into()],
                ..Default::default()
            },
        )
        .unwrap();

        let conn = d
            .dial(&Destination::tcp("127.0.0.1", addr.port()))
            .await
            .unwrap();
        assert_eq!(conn.alpn.as_deref(), Some("h2"));

        drop(conn);
        server.await.unwrap();
    }
}
