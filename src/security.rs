//! URL validation and filesystem path safety.
//!
//! Every URL the downloader or preloader touches passes through
//! [`UrlValidator`], which defends against SSRF when resuming downloads from
//! stored URLs. [`sanitize_filename`] and [`join_under`] are the only way the
//! core produces filesystem paths from untrusted input.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Ports never allowed in asset URLs, regardless of host.
const BLOCKED_PORTS: [u16; 7] = [22, 23, 25, 445, 3389, 6379, 27017];

/// Windows device names that cannot be used as file stems.
const WINDOWS_RESERVED: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Characters illegal in filenames on at least one supported platform.
const ILLEGAL_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Default maximum filename length.
pub const DEFAULT_MAX_FILENAME_LEN: usize = 200;

/// Errors from path-safety operations.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// A joined path resolved outside its base directory.
    #[error("path escape: {part} leaves base directory {base}")]
    PathEscape {
        /// Base directory the path must stay under.
        base: PathBuf,
        /// The offending component.
        part: String,
    },
}

/// SSRF-aware URL validator.
///
/// A URL is accepted only if its scheme is allowed, its host equals or is a
/// subdomain of an allowed host, its port is not blocked, and (optionally)
/// neither the literal address nor any DNS-resolved address falls into a
/// private or reserved network.
///
/// # Example
///
/// ```
/// use booruview_core::security::UrlValidator;
///
/// let validator = UrlValidator::new(["https"], ["files.example.net"]);
/// assert!(validator.validate("https://files.example.net/a.jpg"));
/// assert!(!validator.validate("http://files.example.net/a.jpg"));
/// assert!(!validator.validate("https://evil.example/a.jpg"));
/// ```
#[derive(Debug, Clone)]
pub struct UrlValidator {
    allowed_schemes: HashSet<String>,
    allowed_hosts: HashSet<String>,
    block_private_ips: bool,
    resolve_dns: bool,
}

impl UrlValidator {
    /// Creates a validator with private-IP blocking and DNS resolution on.
    pub fn new<S, H>(schemes: S, hosts: H) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        H: IntoIterator,
        H::Item: Into<String>,
    {
        Self {
            allowed_schemes: schemes.into_iter().map(Into::into).collect(),
            allowed_hosts: hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
            block_private_ips: true,
            resolve_dns: true,
        }
    }

    /// Disables or enables the private/reserved network check.
    #[must_use]
    pub fn block_private_ips(mut self, block: bool) -> Self {
        self.block_private_ips = block;
        self
    }

    /// Disables or enables DNS resolution of non-literal hosts.
    #[must_use]
    pub fn resolve_dns(mut self, resolve: bool) -> Self {
        self.resolve_dns = resolve;
        self
    }

    /// Returns whether the URL is safe to fetch.
    #[must_use]
    pub fn validate(&self, url: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        let Ok(parsed) = Url::parse(url) else {
            debug!(url, "rejected: unparseable URL");
            return false;
        };

        if !self.allowed_schemes.contains(parsed.scheme()) {
            debug!(url, scheme = parsed.scheme(), "rejected: scheme not allowed");
            return false;
        }

        if let Some(port) = parsed.port() {
            if BLOCKED_PORTS.contains(&port) {
                debug!(url, port, "rejected: blocked port");
                return false;
            }
        }

        let Some(host) = parsed.host_str() else {
            debug!(url, "rejected: no host");
            return false;
        };
        let host = host.trim_matches(['[', ']']).to_ascii_lowercase();

        if !self.is_host_allowed(&host) {
            debug!(url, host, "rejected: host not in allowlist");
            return false;
        }

        if self.block_private_ips && !self.check_not_private(&host) {
            warn!(url, host, "rejected: private or reserved address");
            return false;
        }

        true
    }

    fn is_host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }

    /// Returns `true` when the host is definitely not a private address.
    ///
    /// Resolution failures are allowed conservatively: the subsequent
    /// connection will fail on its own, and refusing here would break
    /// offline-configured allowlists.
    fn check_not_private(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return !is_private_ip(ip);
        }

        if self.resolve_dns {
            match (host, 0u16).to_socket_addrs() {
                Ok(addrs) => {
                    for addr in addrs {
                        if is_private_ip(addr.ip()) {
                            warn!(host, ip = %addr.ip(), "host resolves to private address");
                            return false;
                        }
                    }
                }
                Err(err) => {
                    debug!(host, error = %err, "DNS resolution failed, allowing");
                }
            }
        }

        true
    }
}

/// Returns whether an address lies in a private or reserved network.
///
/// Covers RFC 1918, loopback, link-local, IPv6 ULA (fc00::/7) and IPv6
/// link-local (fe80::/10), including their IPv4-mapped forms.
#[must_use]
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || a == 127
                || (a == 169 && b == 254)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            v6 == Ipv6Addr::LOCALHOST
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Cleans a filename of control characters, illegal characters, and
/// Windows-specific hazards, truncating to `max_len` while preserving the
/// extension. Empty results fall back to `"file"`.
#[must_use]
pub fn sanitize_filename(name: &str, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .filter(|c| {
            let code = *c as u32;
            (32..127).contains(&code) && !ILLEGAL_CHARS.contains(c)
        })
        .collect();

    cleaned = cleaned.trim_matches([' ', '.']).to_string();

    if cleaned.is_empty() {
        return "file".to_string();
    }

    if cleaned.len() > max_len {
        cleaned = truncate_keeping_extension(&cleaned, max_len);
    }

    let stem = cleaned.split('.').next().unwrap_or("").to_ascii_uppercase();
    if WINDOWS_RESERVED.contains(&stem.as_str()) {
        cleaned.insert(0, '_');
    }

    cleaned
}

fn truncate_keeping_extension(name: &str, max_len: usize) -> String {
    if let Some(dot) = name.rfind('.') {
        let (base, ext) = name.split_at(dot);
        // ext includes the dot
        if ext.len() < max_len {
            let max_base = max_len - ext.len();
            let cut = floor_char_boundary(base, max_base);
            return format!("{}{}", &base[..cut], ext);
        }
    }
    let cut = floor_char_boundary(name, max_len);
    name[..cut].to_string()
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Joins `parts` under `base`, refusing any component that would leave it.
///
/// Rejects `..` components, root components, and absolute parts before
/// joining, then verifies the result still starts with the resolved base.
///
/// # Errors
///
/// Returns [`SecurityError::PathEscape`] when any part would resolve outside
/// `base`.
pub fn join_under(base: &Path, parts: &[&str]) -> Result<PathBuf, SecurityError> {
    let resolved_base = if base.is_absolute() {
        base.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(base))
            .unwrap_or_else(|_| base.to_path_buf())
    };

    let mut joined = resolved_base.clone();
    for part in parts {
        let candidate = Path::new(part);
        for component in candidate.components() {
            match component {
                Component::Normal(os) => joined.push(os),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(SecurityError::PathEscape {
                        base: resolved_base,
                        part: (*part).to_string(),
                    });
                }
            }
        }
        // Backslash separators are not path separators on Unix; a part that
        // still smuggles ".." through them is rejected outright.
        if part.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(SecurityError::PathEscape {
                base: resolved_base,
                part: (*part).to_string(),
            });
        }
    }

    if !joined.starts_with(&resolved_base) {
        return Err(SecurityError::PathEscape {
            base: resolved_base,
            part: parts.join("/"),
        });
    }

    Ok(joined)
}
