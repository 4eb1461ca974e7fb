//! Probe execution: TCP connect, HTTP GET, HTTPS GET.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::pem::PemObject;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::{CheckKind, HealthCheckSpec};

/// Why a probe failed. Recorded on the target, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckFailure {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("timed out")]
    Timeout,

    #[error("no route to host")]
    NoRoute,

    #[error("io error: {0}")]
    Io(String),

    #[error("ssl error: {0}")]
    Ssl(String),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
}

fn classify_io(e: std::io::Error) -> CheckFailure {
    match e.kind() {
        ErrorKind::ConnectionRefused => CheckFailure::ConnectionRefused,
        ErrorKind::TimedOut => CheckFailure::Timeout,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::AddrNotAvailable => {
            CheckFailure::NoRoute
        }
        _ => CheckFailure::Io(e.to_string()),
    }
}

/// Run one probe against `addr` as described by `spec`. Returns the round
/// trip latency on success.
pub async fn run_check(addr: SocketAddr, spec: &HealthCheckSpec) -> Result<Duration, CheckFailure> {
    let budget = Duration::from_millis(spec.timeout_ms);
    let started = Instant::now();
    let outcome = timeout(budget, async {
        match spec.kind {
            CheckKind::None => Ok(()),
            CheckKind::Tcp => {
                let stream = TcpStream::connect(addr).await.map_err(classify_io)?;
                drop(stream);
                Ok(())
            }
            CheckKind::Http => {
                let mut stream = TcpStream::connect(addr).await.map_err(classify_io)?;
                http_exchange(&mut stream, addr, spec).await
            }
            CheckKind::Https => {
                let stream = TcpStream::connect(addr).await.map_err(classify_io)?;
                let connector = TlsConnector::from(tls_config(spec)?);
                let server_name = rustls_pki_types::ServerName::from(addr.ip());
                let mut tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| CheckFailure::Ssl(e.to_string()))?;
                http_exchange(&mut tls, addr, spec).await
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CheckFailure::Timeout),
    }
}

async fn http_exchange<S>(
    stream: &mut S,
    addr: SocketAddr,
    spec: &HealthCheckSpec,
) -> Result<(), CheckFailure>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        spec.path,
        addr.ip()
    );
    stream.write_all(request.as_bytes()).await.map_err(classify_io)?;

    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await.map_err(classify_io)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(2).any(|w| w == b"\r\n") {
            break;
        }
        if buf.len() > 8 * 1024 {
            break;
        }
    }

    let status = parse_status_line(&buf)
        .ok_or_else(|| CheckFailure::Io("malformed status line".to_string()))?;
    if spec.expected_statuses.contains(&status) {
        Ok(())
    } else {
        Err(CheckFailure::UnexpectedStatus(status))
    }
}

fn parse_status_line(buf: &[u8]) -> Option<u16> {
    let line = buf.split(|&b| b == b'\r').next()?;
    let text = std::str::from_utf8(line).ok()?;
    if !text.starts_with("HTTP/") {
        return None;
    }
    text.split_whitespace().nth(1)?.parse().ok()
}

/// HTTPS probes verify against an empty trust store unless a CA bundle is
/// configured, so a self-signed backend fails with `ssl error`.
fn tls_config(spec: &HealthCheckSpec) -> Result<Arc<ClientConfig>, CheckFailure> {
    let mut roots = RootCertStore::empty();
    if let Some(path) = &spec.ca_bundle {
        let certs = rustls_pki_types::CertificateDer::pem_file_iter(path)
            .map_err(|e| CheckFailure::Ssl(format!("ca bundle: {e}")))?;
        for cert in certs {
            let cert = cert.map_err(|e| CheckFailure::Ssl(format!("ca bundle: {e}")))?;
            roots.add(cert).map_err(|e| CheckFailure::Ssl(format!("ca bundle: {e}")))?;
        }
    }
    let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn spec(kind: CheckKind) -> HealthCheckSpec {
        HealthCheckSpec { kind, timeout_ms: 1_000, ..Default::default() }
    }

    #[tokio::test]
    async fn tcp_check_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        assert!(run_check(addr, &spec(CheckKind::Tcp)).await.is_ok());
    }

    #[tokio::test]
    async fn tcp_check_classifies_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert_eq!(
            run_check(addr, &spec(CheckKind::Tcp)).await.unwrap_err(),
            CheckFailure::ConnectionRefused
        );
    }

    #[tokio::test]
    async fn http_check_matches_expected_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        assert!(run_check(addr, &spec(CheckKind::Http)).await.is_ok());
    }

    #[tokio::test]
    async fn http_check_reports_unexpected_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
                .await;
        });
        assert_eq!(
            run_check(addr, &spec(CheckKind::Http)).await.unwrap_err(),
            CheckFailure::UnexpectedStatus(503)
        );
    }

    #[tokio::test]
    async fn https_check_fails_against_plain_listener() {
        // The listener speaks plaintext, so the handshake surfaces an SSL
        // error (or times out closing), never a success.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
        });
        let err = run_check(addr, &spec(CheckKind::Https)).await.unwrap_err();
        assert!(matches!(err, CheckFailure::Ssl(_) | CheckFailure::Timeout), "{err:?}");
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line(b"HTTP/1.1 204 No Content\r\n"), Some(204));
        assert_eq!(parse_status_line(b"HTTP/1.0 200 OK\r\n\r\nbody"), Some(200));
        assert_eq!(parse_status_line(b"SSH-2.0-OpenSSH\r\n"), None);
        assert_eq!(parse_status_line(b""), None);
    }
}
