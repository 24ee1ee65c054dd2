//! Stack configuration: virtual interface addressing plus the recognized
//! engine sizing knobs. Everything has a default tuned for tunnel extensions
//! with tight memory budgets.

use crate::error::StackError;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Addressing for the virtual interface. The defaults sit in 240.0.0.0/4,
/// well outside normal public routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Settings {
    pub ip_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Default for Ipv4Settings {
    fn default() -> Self {
        Self {
            ip_address: Ipv4Addr::new(240, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 0, 0, 0),
            gateway: Ipv4Addr::new(240, 0, 0, 254),
        }
    }
}

impl Ipv4Settings {
    /// Prefix length of `netmask`. Only meaningful after `validate`.
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.netmask).count_ones() as u8
    }

    pub fn validate(&self) -> Result<(), StackError> {
        let mask = u32::from(self.netmask);
        // Mask bits must be contiguous from the top.
        if mask.leading_ones() != mask.count_ones() {
            return Err(StackError::Config(format!(
                "netmask {} is not contiguous",
                self.netmask
            )));
        }
        if self.ip_address.is_unspecified() || self.gateway.is_unspecified() {
            return Err(StackError::Config(
                "ip address and gateway must be set".to_string(),
            ));
        }
        if u32::from(self.ip_address) & mask != u32::from(self.gateway) & mask {
            return Err(StackError::Config(format!(
                "gateway {} is outside {}/{}",
                self.gateway,
                self.ip_address,
                self.prefix_len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub ipv4: Ipv4Settings,
    pub mtu: usize,
    /// TCP maximum segment size used for writability accounting.
    pub mss: usize,
    /// Per-flow engine receive window.
    pub tcp_rx_buffer_size: usize,
    /// Per-flow engine send buffer.
    pub tcp_tx_buffer_size: usize,
    /// Number of pooled engine sockets, i.e. the concurrent flow ceiling.
    pub socket_pool_size: usize,
    /// Inbound packet ring depth between the facade and the engine.
    pub ring_capacity: usize,
    /// Engine timeout tick.
    pub timer_interval: Duration,
    /// Keepalive probe interval on accepted flows; `None` disables.
    pub keepalive_interval: Option<Duration>,
    /// Engine-side give-up timeout for unresponsive peers.
    pub engine_timeout: Option<Duration>,
    /// How long a graceful close may stay in the FIN exchange before the
    /// flow is aborted.
    pub graceful_close_timeout: Duration,
    /// Outbound batch flushes when it holds at least this many bytes...
    pub batch_max_bytes: usize,
    /// ...or at least this many packets...
    pub batch_max_packets: usize,
    /// ...or when this deadline passes. Zero flushes at the end of every
    /// packets-context turn (low-latency mode).
    pub flush_interval: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            ipv4: Ipv4Settings::default(),
            mtu: 1500,
            mss: 1460,
            tcp_rx_buffer_size: 64 * 1024,
            tcp_tx_buffer_size: 32 * 1024,
            socket_pool_size: 128,
            ring_capacity: 512,
            timer_interval: Duration::from_millis(250),
            keepalive_interval: Some(Duration::from_secs(75)),
            engine_timeout: Some(Duration::from_secs(120)),
            graceful_close_timeout: Duration::from_millis(5_000),
            batch_max_bytes: 64 * 1024,
            batch_max_packets: 64,
            flush_interval: Duration::from_millis(10),
        }
    }
}

impl StackConfig {
    pub fn validate(&self) -> Result<(), StackError> {
        self.ipv4.validate()?;
        if self.socket_pool_size == 0 {
            return Err(StackError::Config("socket pool cannot be empty".into()));
        }
        if self.tcp_rx_buffer_size == 0 || self.tcp_tx_buffer_size == 0 {
            return Err(StackError::Config("socket buffers cannot be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StackConfig::default().validate().expect("default config");
        assert_eq!(Ipv4Settings::default().prefix_len(), 8);
    }

    #[test]
    fn rejects_split_netmask() {
        let settings = Ipv4Settings {
            netmask: Ipv4Addr::new(255, 0, 255, 0),
            ..Ipv4Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_gateway_outside_subnet() {
        let settings = Ipv4Settings {
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            ..Ipv4Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
