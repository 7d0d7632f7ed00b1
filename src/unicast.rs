use crate::supervisor::{execute, SupervisorError, SupervisorOptions};
use crate::transport::Transport;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::NamedTempFile;

static MAC_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i)[0-9a-f]{2}(:[0-9a-f]{2}){5}$").unwrap());

/// Network transport named in a unicast master table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UnicastTransport {
    L2,
    #[serde(rename = "UDPv4")]
    UdpV4,
    #[serde(rename = "UDPv6")]
    UdpV6,
}

impl UnicastTransport {
    pub fn keyword(self) -> &'static str {
        match self {
            UnicastTransport::L2 => "L2",
            UnicastTransport::UdpV4 => "UDPv4",
            UnicastTransport::UdpV6 => "UDPv6",
        }
    }
}

impl fmt::Display for UnicastTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// The peer's address in the form its transport needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    Mac(String),
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl PeerAddress {
    pub fn transport(&self) -> UnicastTransport {
        match self {
            PeerAddress::Mac(_) => UnicastTransport::L2,
            PeerAddress::V4(_) => UnicastTransport::UdpV4,
            PeerAddress::V6(_) => UnicastTransport::UdpV6,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Mac(mac) => f.write_str(mac),
            PeerAddress::V4(ip) => write!(f, "{ip}"),
            PeerAddress::V6(ip) => write!(f, "{ip}"),
        }
    }
}

#[derive(Debug)]
pub enum UnicastError {
    /// The lookup command could not run or exited non-zero.
    Lookup {
        tag: String,
        what: &'static str,
        source: SupervisorError,
    },
    /// The lookup ran but printed nothing usable (or complained on stderr).
    NotFound {
        tag: String,
        what: &'static str,
        detail: String,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for UnicastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnicastError::Lookup { tag, what, source } => {
                write!(f, "{tag} | can't find {what}: {source}")
            }
            UnicastError::NotFound { tag, what, detail } => {
                write!(f, "{tag} | can't find {what}: {detail}")
            }
            UnicastError::Io { path, source } => {
                write!(f, "failed to write unicast config from {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for UnicastError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnicastError::Lookup { source, .. } => Some(source),
            UnicastError::Io { source, .. } => Some(source),
            UnicastError::NotFound { .. } => None,
        }
    }
}

/// ptp4l config text declaring `peer` as the only unicast master, attached
/// to `interface`.
pub fn unicast_section(peer: &PeerAddress, interface: &str) -> String {
    format!(
        "\n[unicast_master_table]\n\
         table_id\t\t1\n\
         logQueryInterval\t2\n\
         {}\t\t{}\n\
         \n\
         [{}]\n\
         unicast_master_table\t1\n",
        peer.transport().keyword(),
        peer,
        interface
    )
}

/// Copy `original` into a temp file and append `section`.
///
/// The file is deleted when the returned handle drops.
pub fn write_unicast_config(
    original: &Path,
    section: &str,
    prefix: &str,
) -> Result<NamedTempFile, UnicastError> {
    let io_err = |source| UnicastError::Io {
        path: original.to_path_buf(),
        source,
    };
    let contents = std::fs::read(original).map_err(io_err)?;
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".cfg")
        .tempfile()
        .map_err(io_err)?;
    file.write_all(&contents).map_err(io_err)?;
    file.write_all(section.as_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(file)
}

fn first_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|l| !l.is_empty())
}

/// `ip` prints `addr/prefix`; keep the address.
fn strip_prefix_len(cidr: &str) -> &str {
    cidr.split('/').next().unwrap_or(cidr)
}

pub fn parse_ipv4_output(stdout: &str) -> Option<Ipv4Addr> {
    first_line(stdout).and_then(|l| strip_prefix_len(l).parse().ok())
}

pub fn parse_ipv6_output(stdout: &str) -> Option<Ipv6Addr> {
    first_line(stdout).and_then(|l| strip_prefix_len(l).parse().ok())
}

pub fn parse_mac_output(stdout: &str) -> Option<String> {
    first_line(stdout)
        .filter(|l| MAC_ADDRESS.is_match(l))
        .map(str::to_lowercase)
}

fn ipv4_argv(interface: &str) -> Vec<String> {
    vec![format!(
        "ip -f inet addr show {interface} | awk '/inet / {{print $2}}'"
    )]
}

fn ipv6_argv(interface: &str, scope: &str) -> Vec<String> {
    vec![format!(
        "ip -6 addr ls -deprecated primary dev {interface} scope {scope} | awk '/inet6/{{print $2}}'"
    )]
}

fn mac_argv(interface: &str) -> Vec<String> {
    vec![format!("cat /sys/class/net/{interface}/address")]
}

async fn lookup<T>(
    host: &dyn Transport,
    tag: &str,
    what: &'static str,
    argv: Vec<String>,
    options: &SupervisorOptions,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, UnicastError> {
    let out = execute(host, tag, &argv, options)
        .await
        .map_err(|e| UnicastError::Lookup {
            tag: tag.to_string(),
            what,
            source: e,
        })?;
    tracing::debug!(host = tag, what, exit = %out.exit, stdout = out.stdout.trim(), "address lookup finished");
    // The pipe through awk hides ip's exit status; stderr is the only signal.
    if !out.stderr.trim().is_empty() {
        return Err(UnicastError::NotFound {
            tag: tag.to_string(),
            what,
            detail: out.stderr.trim().to_string(),
        });
    }
    parse(&out.stdout).ok_or_else(|| UnicastError::NotFound {
        tag: tag.to_string(),
        what,
        detail: format!("unexpected output {:?}", out.stdout.trim()),
    })
}

/// Ask `host` for the address of its `interface` that `transport` needs.
///
/// IPv6 prefers a global address and falls back to link-local.
pub async fn discover_peer_address(
    transport: UnicastTransport,
    host: &dyn Transport,
    tag: &str,
    interface: &str,
    options: &SupervisorOptions,
) -> Result<PeerAddress, UnicastError> {
    match transport {
        UnicastTransport::L2 => lookup(host, tag, "MAC address", mac_argv(interface), options, parse_mac_output)
            .await
            .map(PeerAddress::Mac),
        UnicastTransport::UdpV4 => lookup(
            host,
            tag,
            "IPv4 address",
            ipv4_argv(interface),
            options,
            parse_ipv4_output,
        )
        .await
        .map(PeerAddress::V4),
        UnicastTransport::UdpV6 => {
            let global = lookup(
                host,
                tag,
                "global IPv6 address",
                ipv6_argv(interface, "global"),
                options,
                parse_ipv6_output,
            )
            .await;
            let ip = match global {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::info!(host = tag, error = %e, "falling back to link-local IPv6");
                    lookup(
                        host,
                        tag,
                        "link-local IPv6 address",
                        ipv6_argv(interface, "link"),
                        options,
                        parse_ipv6_output,
                    )
                    .await?
                }
            };
            Ok(PeerAddress::V6(ip))
        }
    }
}
