/// TLS and scheme policy for every request of an invocation.
///
/// Built only from the single `insecure` switch, so plain HTTP and skipped
/// certificate verification are always enabled or disabled together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportPolicy {
    allow_http: bool,
    skip_tls_verify: bool,
}

impl TransportPolicy {
    pub fn from_insecure(insecure: bool) -> Self {
        TransportPolicy {
            allow_http: insecure,
            skip_tls_verify: insecure,
        }
    }

    pub fn allow_http(&self) -> bool {
        self.allow_http
    }

    pub fn skip_tls_verify(&self) -> bool {
        self.skip_tls_verify
    }

    /// Schemes to try, in order, when first contacting the registry.
    pub fn schemes(&self) -> &'static [&'static str] {
        if self.allow_http {
            &["https", "http"]
        } else {
            &["https"]
        }
    }

    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(self.skip_tls_verify)
            .build()
    }
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self::from_insecure(false)
    }
}
