use crate::response::Response;
use crate::share::RecvStream;
use crate::tls::{TlsContext, TlsOptions};
use crate::Error;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Arc;

/// The application callable a host dispatches requests to.
pub type Application = Arc<
    dyn Fn(http::Request<RecvStream>, Response) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>
        + Send
        + Sync,
>;

/// A normalized listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAddress {
    Wildcard,
    Ip(IpAddr),
}

impl HostAddress {
    /// `*` stays wildcard, `::` canonicalizes to `[::]`, IPv6 must be
    /// bracketed, anything else has to parse as IPv4.
    fn parse(addr: &str) -> Result<HostAddress, Error> {
        if addr == "*" {
            return Ok(HostAddress::Wildcard);
        }

        if addr == "::" {
            return Ok(HostAddress::Ip(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        }

        if let Some(inner) = addr.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
            let ip: Ipv6Addr = inner
                .parse()
                .map_err(|_| Error::config(format!("Invalid IPv6 listen address: {}", addr)))?;
            return Ok(HostAddress::Ip(IpAddr::V6(ip)));
        }

        let ip: std::net::Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::config(format!("Invalid listen address: {}", addr)))?;
        Ok(HostAddress::Ip(IpAddr::V4(ip)))
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostAddress::Wildcard => write!(f, "*"),
            HostAddress::Ip(IpAddr::V4(ip)) => write!(f, "{}", ip),
            HostAddress::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
        }
    }
}

/// One virtual host: where it listens, what it is called, the
/// application serving it and optionally a validated TLS record.
pub struct Host {
    address: HostAddress,
    port: u16,
    name: String,
    application: Application,
    tls: Option<TlsContext>,
}

impl Host {
    pub fn new(
        address: &str,
        port: u16,
        name: &str,
        application: Application,
    ) -> Result<Host, Error> {
        let address = HostAddress::parse(address)?;

        if port == 0 {
            return Err(Error::config("Port must be in 1..=65535"));
        }

        Ok(Host {
            address,
            port,
            name: name.to_ascii_lowercase(),
            application,
            tls: None,
        })
    }

    /// Attach TLS. The options are validated against the host name.
    pub fn with_tls(mut self, options: TlsOptions) -> Result<Host, Error> {
        let ctx = TlsContext::from_options(options, &self.name)?;
        self.tls = Some(ctx);
        Ok(self)
    }

    pub fn address(&self) -> HostAddress {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    /// Invoke the application for one request/response pair.
    pub fn handle(
        &self,
        req: http::Request<RecvStream>,
        res: Response,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> {
        (self.application)(req, res)
    }

    fn id_host(&self) -> String {
        if self.name.is_empty() {
            self.address.to_string()
        } else {
            self.name.clone()
        }
    }

    /// The identity key `"<name-or-address>:<port>"`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.id_host(), self.port)
    }

    /// Identity match where either side of the queried id may be `*`.
    pub fn matches(&self, id: &str) -> bool {
        if id == "*" || id == "*:*" {
            return true;
        }

        if id == self.id() {
            return true;
        }

        let (host, port) = match id.rsplit_once(':') {
            Some(x) => x,
            None => return false,
        };

        let my_host = self.id_host();
        let host_ok = host == "*" || my_host == "*" || host == my_host;
        let port_ok = port == "*" || port.parse() == Ok(self.port);

        host_ok && port_ok
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id())
            .field("address", &self.address)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

/// Pure lookup from identity strings to hosts. Read-only while
/// connections are being handled.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Vec<Arc<Host>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        HostRegistry::default()
    }

    /// Register a host. Two hosts with the same identity key are a
    /// configuration error.
    pub fn add(&mut self, host: Host) -> Result<(), Error> {
        if self.hosts.iter().any(|h| h.id() == host.id()) {
            return Err(Error::config(format!(
                "Duplicate host identity: {}",
                host.id()
            )));
        }

        debug!("Registered host: {}", host.id());
        self.hosts.push(Arc::new(host));
        Ok(())
    }

    /// First registered host matching the identity.
    pub fn lookup(&self, id: &str) -> Option<&Arc<Host>> {
        self.hosts.iter().find(|h| h.matches(id))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_app() -> Application {
        Arc::new(|_req, _res| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn address_normalization() {
        assert_eq!(
            HostAddress::parse("*").unwrap().to_string(),
            "*"
        );
        assert_eq!(
            HostAddress::parse("::").unwrap().to_string(),
            "[::]"
        );
        assert_eq!(
            HostAddress::parse("[::1]").unwrap().to_string(),
            "[::1]"
        );
        assert_eq!(
            HostAddress::parse("0.0.0.0").unwrap().to_string(),
            "0.0.0.0"
        );

        assert!(HostAddress::parse("not-an-ip").is_err());
        assert!(HostAddress::parse("::1").is_err()); // v6 must be bracketed
    }

    #[test]
    fn port_zero_is_config_error() {
        let r = Host::new("*", 0, "", noop_app());
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn identity_key() {
        let h = Host::new("0.0.0.0", 1337, "Example.COM", noop_app()).unwrap();
        assert_eq!(h.id(), "example.com:1337");

        let anon = Host::new("0.0.0.0", 1337, "", noop_app()).unwrap();
        assert_eq!(anon.id(), "0.0.0.0:1337");
    }

    #[test]
    fn matching_scenarios() {
        let h = Host::new("0.0.0.0", 1337, "example.com", noop_app()).unwrap();

        assert!(h.matches("example.com:1337"));
        assert!(h.matches("*:1337"));
        assert!(h.matches("example.com:*"));
        assert!(!h.matches("other:1337"));
        assert!(!h.matches("example.com:9999"));
        assert!(h.matches("*"));
        assert!(h.matches("*:*"));
    }

    #[test]
    fn wildcard_matching_is_symmetric() {
        let a = Host::new("0.0.0.0", 1337, "example.com", noop_app()).unwrap();
        let b = Host::new("*", 1337, "", noop_app()).unwrap();

        assert_eq!(a.matches("*:1337"), b.matches(&a.id()));
    }

    #[test]
    fn registry_lookup_and_duplicates() {
        let mut reg = HostRegistry::new();
        reg.add(Host::new("*", 80, "example.com", noop_app()).unwrap())
            .unwrap();
        reg.add(Host::new("*", 80, "other.com", noop_app()).unwrap())
            .unwrap();

        assert!(reg.lookup("example.com:80").is_some());
        assert!(reg.lookup("other.com:80").is_some());
        assert!(reg.lookup("missing.com:80").is_none());

        let dup = Host::new("*", 80, "example.com", noop_app()).unwrap();
        assert!(matches!(reg.add(dup), Err(Error::Config(_))));
    }

    #[test]
    fn encryption_flag() {
        let h = Host::new("*", 443, "example.com", noop_app()).unwrap();
        assert!(!h.is_encrypted());
    }
}
