use std::fmt;

use http::Uri;
use url::Url;

use crate::error::Error;
use crate::util::{default_port, is_https_scheme};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn is_secure(self) -> bool {
        matches!(self, Self::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NoProxyRule {
    Any,
    Domain { host: String, port: Option<u16> },
}

impl NoProxyRule {
    pub fn parse(text: &str) -> Option<Self> {
        let mut candidate = text.trim().to_owned();
        let mut port = None;
        if candidate.is_empty() {
            return None;
        }
        if candidate == "*" {
            return Some(Self::Any);
        }
        if let Ok(url) = Url::parse(&candidate)
            && let Some(host) = url.host_str()
        {
            candidate = host.to_owned();
            port = url.port();
        }
        candidate = candidate.trim_start_matches('.').to_owned();
        if let Some(stripped) = candidate.strip_prefix('[') {
            let end = stripped.find(']')?;
            let host = &stripped[..end];
            let suffix = &stripped[end + 1..];
            if let Some(raw_port) = suffix.strip_prefix(':') {
                port = Some(raw_port.parse::<u16>().ok()?);
            } else if !suffix.is_empty() {
                return None;
            }
            candidate = host.to_owned();
        } else if candidate.matches(':').count() == 1 {
            let (host, raw_port) = candidate.rsplit_once(':')?;
            port = Some(raw_port.parse::<u16>().ok()?);
            candidate = host.to_owned();
        }
        if candidate.is_empty() {
            return None;
        }
        Some(Self::Domain {
            host: candidate.to_ascii_lowercase(),
            port,
        })
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        match self {
            Self::Any => true,
            Self::Domain {
                host: domain,
                port: rule_port,
            } => {
                let host_matches = host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'));
                host_matches && rule_port.is_none_or(|rule_port| rule_port == port)
            }
        }
    }
}

/// Proxy a request is routed through, plus the hosts that bypass it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyServer {
    host: String,
    port: u16,
    no_proxy: Vec<NoProxyRule>,
}

impl ProxyServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            no_proxy: Vec::new(),
        }
    }

    /// Parses `http://proxy.local:3128`; a missing port defaults per scheme.
    pub fn from_uri(uri: &str) -> crate::Result<Self> {
        let parsed: Uri = uri.parse().map_err(|_| Error::InvalidUri {
            uri: uri.to_owned(),
        })?;
        let (Some(host), Some(port)) = (parsed.host(), default_port(&parsed)) else {
            return Err(Error::InvalidUri {
                uri: uri.to_owned(),
            });
        };
        Ok(Self::new(host, port))
    }

    pub fn with_no_proxy<I, S>(mut self, rules: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for rule in rules {
            let rule = rule.as_ref();
            let parsed = NoProxyRule::parse(rule).ok_or_else(|| Error::InvalidNoProxyRule {
                rule: rule.to_owned(),
            })?;
            self.no_proxy.push(parsed);
        }
        Ok(self)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bypasses(&self, host: &str, port: u16) -> bool {
        let host = host.to_ascii_lowercase();
        self.no_proxy.iter().any(|rule| rule.matches(&host, port))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyIdentity {
    pub host: String,
    pub port: u16,
}

/// Identifies which idle queue a connection belongs to.
///
/// Two requests share pooled connections only when their keys are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    scheme: Scheme,
    host: String,
    port: u16,
    proxy: Option<ProxyIdentity>,
}

impl PartitionKey {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyIdentity) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn for_request(uri: &Uri, proxy: Option<&ProxyServer>) -> crate::Result<Self> {
        let invalid = || Error::InvalidUri {
            uri: uri.to_string(),
        };
        let scheme = match uri.scheme_str() {
            Some(scheme) if is_https_scheme(scheme) => Scheme::Https,
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("ws") =>
            {
                Scheme::Http
            }
            _ => return Err(invalid()),
        };
        let host = uri.host().ok_or_else(invalid)?;
        let port = default_port(uri).ok_or_else(invalid)?;
        let key = Self::new(scheme, host, port);
        match proxy {
            Some(proxy) if !proxy.bypasses(host, port) => Ok(key.with_proxy(ProxyIdentity {
                host: proxy.host.clone(),
                port: proxy.port,
            })),
            _ => Ok(key),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&ProxyIdentity> {
        self.proxy.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// `host:port` of the endpoint the transport dials: the proxy when one is set.
    pub fn connect_target(&self) -> (&str, u16) {
        match &self.proxy {
            Some(proxy) => (&proxy.host, proxy.port),
            None => (&self.host, self.port),
        }
    }

    pub(crate) fn remote_label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(formatter, " via {}:{}", proxy.host, proxy.port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(text: &str) -> Uri {
        text.parse().expect("uri should parse")
    }

    #[test]
    fn key_normalizes_host_case_and_default_port() {
        let upper = PartitionKey::for_request(&uri("HTTPS://API.Example.com/a"), None)
            .expect("key should build");
        let lower = PartitionKey::for_request(&uri("https://api.example.com:443/b"), None)
            .expect("key should build");
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "https://api.example.com:443");
        assert!(upper.is_secure());
    }

    #[test]
    fn scheme_separates_partitions() {
        let http = PartitionKey::for_request(&uri("http://example.com:8080/"), None)
            .expect("key should build");
        let https = PartitionKey::for_request(&uri("https://example.com:8080/"), None)
            .expect("key should build");
        assert_ne!(http, https);
    }

    #[test]
    fn proxy_is_part_of_the_key_unless_bypassed() {
        let proxy = ProxyServer::from_uri("http://proxy.local:3128")
            .expect("proxy should parse")
            .with_no_proxy([".internal.example"])
            .expect("rules should parse");

        let proxied = PartitionKey::for_request(&uri("http://example.com/"), Some(&proxy))
            .expect("key should build");
        assert_eq!(proxied.connect_target(), ("proxy.local", 3128));
        assert_eq!(proxied.to_string(), "http://example.com:80 via proxy.local:3128");

        let direct =
            PartitionKey::for_request(&uri("http://svc.internal.example/"), Some(&proxy))
                .expect("key should build");
        assert!(direct.proxy().is_none());
        assert_eq!(direct.connect_target(), ("svc.internal.example", 80));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let error = PartitionKey::for_request(&uri("ftp://example.com/"), None)
            .expect_err("ftp is not an http scheme");
        assert!(matches!(error, Error::InvalidUri { .. }));
    }

    #[test]
    fn no_proxy_rule_matches_subdomains_but_not_lookalikes() {
        let rule = NoProxyRule::parse(".example.com").expect("valid rule");
        assert!(rule.matches("example.com", 80));
        assert!(rule.matches("api.example.com", 443));
        assert!(!rule.matches("badexample.com", 80));
    }

    #[test]
    fn no_proxy_rule_honours_port() {
        let rule = NoProxyRule::parse("[::1]:8080").expect("valid ipv6 rule");
        assert!(rule.matches("::1", 8080));
        assert!(!rule.matches("::1", 8081));

        let rule = NoProxyRule::parse("localhost:3000").expect("valid rule");
        assert!(rule.matches("localhost", 3000));
        assert!(!rule.matches("localhost", 80));
    }

    #[test]
    fn invalid_no_proxy_rule_is_reported() {
        let error = ProxyServer::new("proxy", 8080)
            .with_no_proxy(["[::1]not-a-port"])
            .expect_err("malformed rule must be rejected");
        match error {
            Error::InvalidNoProxyRule { rule } => assert_eq!(rule, "[::1]not-a-port"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
