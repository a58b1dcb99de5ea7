//! Session handed to the application once a circuit is available.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Network session configuration routed through the daemon's SOCKS proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    socks_addr: SocketAddr,
}

impl SessionHandle {
    /// Creates a handle for the proxy listening on `socks_addr`.
    pub fn new(socks_addr: SocketAddr) -> Self {
        Self { socks_addr }
    }

    /// Address of the SOCKS5 proxy.
    pub fn socks_addr(&self) -> SocketAddr {
        self.socks_addr
    }

    /// Proxy URL with remote DNS resolution, so host names never leak to
    /// the local resolver.
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}", self.socks_addr)
    }

    /// An HTTP client builder with the proxy applied to every scheme.
    pub fn http_client_builder(&self) -> reqwest::Result<reqwest::ClientBuilder> {
        let proxy = reqwest::Proxy::all(self.proxy_url())?;
        Ok(reqwest::Client::builder().proxy(proxy))
    }

    /// A ready-to-use proxied HTTP client.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        self.http_client_builder()?.build()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.proxy_url())
    }
}
