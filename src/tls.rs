use crate::Error;
use enumflags2::{bitflags, BitFlags};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use x509_parser::prelude::*;

/// Protocol version bits for the `crypto_method` option.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Ssl2 = 0b0000_0001,
    Ssl3 = 0b0000_0010,
    Tls10 = 0b0000_0100,
    Tls11 = 0b0000_1000,
    Tls12 = 0b0001_0000,
}

/// The `crypto_method` option: either a space separated token string or
/// a token list. Tokens OR into a [`TlsVersion`] bitmask.
#[derive(Debug, Clone)]
pub enum CryptoMethod {
    Tokens(String),
    List(Vec<String>),
}

impl Default for CryptoMethod {
    fn default() -> Self {
        CryptoMethod::Tokens("any".into())
    }
}

impl CryptoMethod {
    fn tokens(&self) -> Vec<String> {
        match self {
            CryptoMethod::Tokens(s) => s
                .split_ascii_whitespace()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            CryptoMethod::List(l) => l.iter().map(|t| t.to_ascii_lowercase()).collect(),
        }
    }

    /// Normalize into the version bitmask. Unknown tokens are ignored,
    /// an empty result is a configuration error.
    pub fn version_mask(&self) -> Result<BitFlags<TlsVersion>, Error> {
        let all_tls = TlsVersion::Tls10 | TlsVersion::Tls11 | TlsVersion::Tls12;

        let mut mask = BitFlags::<TlsVersion>::empty();

        for token in self.tokens() {
            match token.as_str() {
                "tls" => mask |= all_tls,
                "tls1" | "tlsv1" | "tlsv1.0" => mask |= TlsVersion::Tls10,
                "tls1.1" | "tlsv1.1" => mask |= TlsVersion::Tls11,
                "tls1.2" | "tlsv1.2" => mask |= TlsVersion::Tls12,
                "ssl2" | "sslv2" => mask |= TlsVersion::Ssl2,
                "ssl3" | "sslv3" => mask |= TlsVersion::Ssl3,
                "sslv23" | "any" => mask |= BitFlags::all(),
                unknown => {
                    trace!("Ignoring unknown crypto_method token: {}", unknown);
                }
            }
        }

        if mask.is_empty() {
            return Err(Error::config("crypto_method produced no protocol versions"));
        }

        Ok(mask)
    }
}

/// Callback slot invoked when a client exceeds the renegotiation limit.
pub type RenegLimitCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// TLS options for an encrypted host.
///
/// Only parsing and validation happen here. Handshaking and context
/// construction belong to the TLS collaborator consuming the validated
/// record.
#[derive(Clone)]
pub struct TlsOptions {
    /// PEM bundle holding the certificate chain and the private key.
    pub local_cert: PathBuf,
    pub passphrase: Option<String>,
    pub allow_self_signed: bool,
    pub verify_peer: bool,
    pub ciphers: Option<String>,
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub single_ecdh_use: bool,
    pub ecdh_curve: String,
    pub honor_cipher_order: bool,
    pub disable_compression: bool,
    pub reneg_limit: u32,
    pub reneg_limit_callback: Option<RenegLimitCallback>,
    pub crypto_method: CryptoMethod,
}

impl TlsOptions {
    /// Options with the defaults merged in: peer verification off,
    /// honor-cipher-order on, compression off, ECDH curve prime256v1.
    pub fn new(local_cert: impl Into<PathBuf>) -> Self {
        TlsOptions {
            local_cert: local_cert.into(),
            passphrase: None,
            allow_self_signed: false,
            verify_peer: false,
            ciphers: None,
            cafile: None,
            capath: None,
            single_ecdh_use: false,
            ecdh_curve: "prime256v1".into(),
            honor_cipher_order: true,
            disable_compression: true,
            reneg_limit: 2,
            reneg_limit_callback: None,
            crypto_method: CryptoMethod::default(),
        }
    }
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("local_cert", &self.local_cert)
            .field("verify_peer", &self.verify_peer)
            .field("ecdh_curve", &self.ecdh_curve)
            .field("honor_cipher_order", &self.honor_cipher_order)
            .field("disable_compression", &self.disable_compression)
            .field("crypto_method", &self.crypto_method)
            .finish()
    }
}

/// Validated TLS options for one host.
#[derive(Debug, Clone)]
pub struct TlsContext {
    options: TlsOptions,
    versions: BitFlags<TlsVersion>,
}

impl TlsContext {
    /// Validate options against the host name. Certificate problems that
    /// would break serving are errors, certificate problems a deployment
    /// may accept (name mismatch, expiry) are logged warnings.
    pub fn from_options(options: TlsOptions, host_name: &str) -> Result<TlsContext, Error> {
        let versions = options.crypto_method.version_mask()?;

        validate_bundle(&options.local_cert, host_name)?;

        Ok(TlsContext { options, versions })
    }

    pub fn options(&self) -> &TlsOptions {
        &self.options
    }

    pub fn versions(&self) -> BitFlags<TlsVersion> {
        self.versions
    }
}

fn validate_bundle(path: &PathBuf, host_name: &str) -> Result<(), Error> {
    let pem = fs::read(path).map_err(|e| {
        Error::config(format!(
            "Cannot read certificate file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut certs: Vec<Vec<u8>> = vec![];
    let mut has_key = false;

    let mut reader = std::io::BufReader::new(&pem[..]);
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| {
            Error::config(format!("Bad PEM in {}: {}", path.display(), e))
        })?;
        match item {
            rustls_pemfile::Item::X509Certificate(der) => certs.push(der.as_ref().to_vec()),
            rustls_pemfile::Item::Pkcs1Key(_)
            | rustls_pemfile::Item::Pkcs8Key(_)
            | rustls_pemfile::Item::Sec1Key(_) => has_key = true,
            _ => {}
        }
    }

    if certs.is_empty() {
        return Err(Error::config(format!(
            "No X.509 certificate in {}",
            path.display()
        )));
    }
    if !has_key {
        return Err(Error::config(format!(
            "Certificate bundle {} contains no private key",
            path.display()
        )));
    }

    let (_, cert) = X509Certificate::from_der(&certs[0]).map_err(|e| {
        Error::config(format!(
            "Unparseable certificate in {}: {}",
            path.display(),
            e
        ))
    })?;

    if !host_name.is_empty() && !cert_covers_name(&cert, host_name) {
        warn!(
            "Certificate {} does not cover host name {}",
            path.display(),
            host_name
        );
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    if cert.validity().not_after.timestamp() < now {
        warn!("Certificate {} has expired", path.display());
    }

    Ok(())
}

fn cert_covers_name(cert: &X509Certificate, host_name: &str) -> bool {
    for cn in cert.subject().iter_common_name() {
        if let Ok(cn) = cn.as_str() {
            if name_covers(cn, host_name) {
                return true;
            }
        }
    }

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                if name_covers(dns, host_name) {
                    return true;
                }
            }
        }
    }

    false
}

/// Certificate name match, including a single leading wildcard label.
fn name_covers(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    if pattern == host {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        if let Some(rest) = host.strip_suffix(suffix) {
            // exactly one extra label
            return rest.ends_with('.') && rest.matches('.').count() == 1;
        }
    }

    false
}
