// Configuration for the RustyMesh message plane
//
// Structured configuration with defaults, plus parsing of the dotted
// option keys recognized by deployments.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{MeshError, Result};

/// Receiver-side configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Interface whose first non-loopback IPv4 address is used to bind.
    /// Unset binds loopback.
    pub network_interface: Option<String>,

    /// Port to bind; 0 lets the OS choose.
    pub bind_port: u16,

    /// Number of reader tasks sharing accepted connections.
    pub num_handlers: usize,

    /// Largest frame accepted from a peer.
    pub max_message_size: usize,

    /// Initial capacity of pooled receive buffers.
    pub recv_buffer_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            network_interface: None,
            bind_port: 0,
            num_handlers: 2,
            max_message_size: 8 * 1024 * 1024,
            recv_buffer_size: 64 * 1024,
        }
    }
}

/// Ordered threading model configuration.
#[derive(Debug, Clone)]
pub struct ThreadingConfig {
    /// Soft cap on outstanding limited jobs.
    pub max_pending: usize,

    /// If true, shutdown does not wait for queued work to drain.
    pub hard_shutdown: bool,

    /// Parallelism of the deserialization pool.
    pub deserialization_threads: usize,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            max_pending: 100_000,
            hard_shutdown: true,
            deserialization_threads: 2,
        }
    }
}

/// Node-wide configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Application name; namespaces the coordination directory.
    pub application: String,

    pub receiver: ReceiverConfig,
    pub threading: ThreadingConfig,

    /// Delay before the reconciler retries after a directory error.
    pub retry_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            application: "mesh".to_string(),
            receiver: ReceiverConfig::default(),
            threading: ThreadingConfig::default(),
            retry_timeout: Duration::from_millis(500),
        }
    }
}

impl MeshConfig {
    /// Root path of this application's coordination namespace.
    pub fn root_path(&self) -> String {
        format!("/{}", self.application)
    }

    /// Apply dotted option keys on top of defaults.
    ///
    /// Unknown keys and unparseable values are configuration errors.
    pub fn from_options(application: &str, options: &HashMap<String, String>) -> Result<Self> {
        let mut config = MeshConfig {
            application: application.to_string(),
            ..Default::default()
        };

        for (key, value) in options {
            match key.as_str() {
                "receiver.network.if" => {
                    config.receiver.network_interface = Some(value.clone());
                }
                "receiver.num_handlers" => {
                    config.receiver.num_handlers = parse(key, value)?;
                }
                "receiver.max_message_size" => {
                    config.receiver.max_message_size = parse(key, value)?;
                }
                "threading.max_pending" => {
                    config.threading.max_pending = parse(key, value)?;
                }
                "threading.hard_shutdown" => {
                    config.threading.hard_shutdown = parse(key, value)?;
                }
                "threading.deserialization_threads" => {
                    config.threading.deserialization_threads = parse(key, value)?;
                }
                _ => {
                    return Err(MeshError::Configuration(format!(
                        "unrecognized option: {}",
                        key
                    )));
                }
            }
        }

        if config.receiver.num_handlers == 0 {
            return Err(MeshError::Configuration(
                "receiver.num_handlers must be at least 1".to_string(),
            ));
        }
        if config.threading.deserialization_threads == 0 {
            return Err(MeshError::Configuration(
                "threading.deserialization_threads must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MeshError::Configuration(format!("invalid value for {}: {}", key, value)))
}

/// Resolve the IPv4 address to bind the receiver to.
///
/// With an interface name, returns its first non-loopback IPv4 address.
/// Without one, returns loopback; deployments spanning hosts set
/// `receiver.network.if`.
#[cfg(unix)]
pub fn resolve_bind_ip(interface: Option<&str>) -> Result<IpAddr> {
    let Some(name) = interface else {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    };

    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return Err(MeshError::Configuration(format!(
                "getifaddrs failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut found = None;
        let mut cur = addrs;
        while !cur.is_null() {
            let ifa = &*cur;
            cur = ifa.ifa_next;

            if ifa.ifa_addr.is_null() {
                continue;
            }
            let ifname = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
            if ifname != name {
                continue;
            }
            if i32::from((*ifa.ifa_addr).sa_family) != libc::AF_INET {
                continue;
            }

            let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            if ip.is_loopback() {
                continue;
            }
            found = Some(IpAddr::V4(ip));
            break;
        }
        libc::freeifaddrs(addrs);

        found.ok_or_else(|| {
            MeshError::Configuration(format!("no usable IPv4 address on interface {}", name))
        })
    }
}

#[cfg(not(unix))]
pub fn resolve_bind_ip(interface: Option<&str>) -> Result<IpAddr> {
    match interface {
        None => Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        Some(name) => Err(MeshError::Configuration(format!(
            "interface lookup not supported on this platform: {}",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.receiver.num_handlers, 2);
        assert_eq!(config.threading.max_pending, 100_000);
        assert_eq!(config.threading.deserialization_threads, 2);
        assert!(config.threading.hard_shutdown);
        assert_eq!(config.retry_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_from_options() {
        let mut options = HashMap::new();
        options.insert("receiver.num_handlers".to_string(), "4".to_string());
        options.insert("threading.max_pending".to_string(), "500".to_string());
        options.insert("threading.hard_shutdown".to_string(), "false".to_string());

        let config = MeshConfig::from_options("trades", &options).unwrap();
        assert_eq!(config.application, "trades");
        assert_eq!(config.receiver.num_handlers, 4);
        assert_eq!(config.threading.max_pending, 500);
        assert!(!config.threading.hard_shutdown);
        assert_eq!(config.root_path(), "/trades");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut options = HashMap::new();
        options.insert("receiver.bogus".to_string(), "1".to_string());
        assert!(MeshConfig::from_options("app", &options).is_err());
    }

    #[test]
    fn test_invalid_value_rejected() {
        let mut options = HashMap::new();
        options.insert("receiver.num_handlers".to_string(), "many".to_string());
        assert!(MeshConfig::from_options("app", &options).is_err());
    }

    #[test]
    fn test_default_bind_is_loopback() {
        let ip = resolve_bind_ip(None).unwrap();
        assert!(ip.is_loopback());
    }
}
