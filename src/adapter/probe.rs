//! HTTP probe used by URL tests
//!
//! A probe dials the test URL's host through an adapter and issues a single
//! HTTP/1.1 `HEAD` over the returned stream, wrapping it in TLS for `https`.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::header::{CONNECTION, HOST, USER_AGENT};
use http::{Method, Request, Uri};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::trace;

use super::ProxyAdapter;
use crate::error::AdapterError;
use crate::metadata::{Metadata, Network};

const PROBE_USER_AGENT: &str = concat!("meta-router/", env!("CARGO_PKG_VERSION"));

/// Parsed probe target
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    uri: Uri,
    host: String,
    port: u16,
    tls: bool,
}

impl ProbeTarget {
    /// Parse an `http` or `https` URL
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Probe` for other schemes or a missing host.
    pub fn parse(url: &str) -> Result<Self, AdapterError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| AdapterError::Probe(format!("invalid url {url}: {e}")))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(AdapterError::Probe(format!("unsupported url scheme: {url}"))),
        };
        let host = uri
            .host()
            .ok_or_else(|| AdapterError::Probe(format!("url has no host: {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self { uri, host, port, tls })
    }

    /// Metadata to dial for this target
    #[must_use]
    pub fn metadata(&self) -> Metadata {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => Metadata::new(Network::Tcp).with_dst(ip, self.port),
            Err(_) => {
                let mut m = Metadata::new(Network::Tcp).with_host(self.host.clone());
                m.dst_port = self.port;
                m
            }
        }
    }
}

/// Send a `HEAD` for `url` through `adapter` and return the status code
///
/// # Errors
///
/// Returns the dial error, or `AdapterError::Probe` for TLS or HTTP failures.
pub async fn head(adapter: &dyn ProxyAdapter, url: &str) -> Result<u16, AdapterError> {
    let target = ProbeTarget::parse(url)?;
    let conn = adapter.dial(&target.metadata()).await?;

    if target.tls {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| AdapterError::Probe(format!("invalid server name {}: {e}", target.host)))?;
        let stream = TlsConnector::from(tls_config()?)
            .connect(server_name, conn)
            .await
            .map_err(|e| AdapterError::Probe(format!("tls handshake: {e}")))?;
        send_head(stream, &target).await
    } else {
        send_head(conn, &target).await
    }
}

async fn send_head<S>(stream: S, target: &ProbeTarget) -> Result<u16, AdapterError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| AdapterError::Probe(format!("http handshake: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!(error = %e, "probe connection closed");
        }
    });

    let authority = target
        .uri
        .authority()
        .map_or(target.host.as_str(), http::uri::Authority::as_str);
    let path = target
        .uri
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    let request = Request::builder()
        .method(Method::HEAD)
        .uri(path)
        .header(HOST, authority)
        .header(USER_AGENT, PROBE_USER_AGENT)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|e| AdapterError::Probe(format!("build request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| AdapterError::Probe(format!("request: {e}")))?;
    Ok(response.status().as_u16())
}

fn tls_config() -> Result<Arc<ClientConfig>, AdapterError> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| AdapterError::Probe(format!("tls config: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::clone(CONFIG.get_or_init(|| Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Direct;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target() {
        let t = ProbeTarget::parse("https://www.gstatic.com/generate_204").unwrap();
        assert!(t.tls);
        assert_eq!(t.port, 443);
        assert_eq!(t.metadata().host, "www.gstatic.com");

        let t = ProbeTarget::parse("http://[::1]:8080/").unwrap();
        assert_eq!(t.metadata().dst_ip, Some("::1".parse().unwrap()));
        assert_eq!(t.metadata().dst_port, 8080);

        assert!(ProbeTarget::parse("ftp://example.com/").is_err());
    }

    #[tokio::test]
    async fn test_head_over_direct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HEAD /generate_204 HTTP/1.1"));
            socket
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let direct = Direct::new("DIRECT");
        let status = head(&direct, &format!("http://{addr}/generate_204")).await.unwrap();
        assert_eq!(status, 204);
    }
}
