use std::time::Duration;

use anyhow::bail;

/// Configuration consumed by the messenger, its accepter and its pipes.
///
/// All settings have defaults that are reasonable for a cluster-internal network; fault
///  injection is off unless explicitly enabled.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Disable Nagle's algorithm on every pipe socket.
    pub tcp_nodelay: bool,

    /// Receive buffer size requested for pipe sockets; 0 leaves the OS default in place.
    ///
    /// NB: For accepted sockets this is applied to the listening socket before `listen`, which
    ///  is inherited by accepted connections on the platforms this crate targets.
    pub tcp_rcvbuf: usize,

    /// A reader that sees no traffic at all for this long treats the socket as dead and
    ///  faults the pipe.
    pub tcp_read_timeout: Duration,

    /// Bind the accepter to an IPv6 wildcard when no explicit bind address is given.
    pub bind_ipv6: bool,

    /// Lower bound (inclusive) of the port range scanned when binding without an explicit port.
    pub bind_port_min: u16,
    /// Upper bound (inclusive) of the port range scanned when binding without an explicit port.
    pub bind_port_max: u16,

    /// First wait after a failed connect attempt; doubled on every subsequent failure.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling reconnect backoff.
    pub max_backoff: Duration,

    /// Skip payload checksums on outgoing messages and payload checksum verification on
    ///  incoming ones. The envelope checksum is always enforced.
    pub nocrc: bool,

    /// Require message signatures from all authenticated peers.
    pub require_signatures: bool,
    /// Require message signatures from authenticated peers whose policy is marked `cluster`.
    pub cluster_require_signatures: bool,
    /// Require message signatures from authenticated peers whose policy is not marked `cluster`.
    pub service_require_signatures: bool,

    /// When nonzero, every socket read or write has a 1-in-n chance of shutting the socket
    ///  down first. Test affordance.
    pub inject_socket_failures: u32,

    /// When set, sleep this long at the handshake's most race-prone points. Test affordance.
    pub inject_internal_delay: Option<Duration>,

    /// Peer types whose pipes get a delayed-delivery queue for inbound messages. Test affordance.
    pub inject_delay_peer_types: Vec<u32>,
    /// Probability (0..=1) that an inbound message on a delaying pipe is deferred.
    pub inject_delay_probability: f64,
    /// Upper bound for the random deferral interval.
    pub inject_delay_max: Duration,
}

impl Default for MessengerConfig {
    fn default() -> MessengerConfig {
        MessengerConfig {
            tcp_nodelay: true,
            tcp_rcvbuf: 0,
            tcp_read_timeout: Duration::from_secs(900),
            bind_ipv6: false,
            bind_port_min: 6800,
            bind_port_max: 7300,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(15),
            nocrc: false,
            require_signatures: false,
            cluster_require_signatures: false,
            service_require_signatures: false,
            inject_socket_failures: 0,
            inject_internal_delay: None,
            inject_delay_peer_types: Vec::new(),
            inject_delay_probability: 0.0,
            inject_delay_max: Duration::ZERO,
        }
    }
}

impl MessengerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_port_min > self.bind_port_max {
            bail!("bind port range is empty: {} > {}", self.bind_port_min, self.bind_port_max);
        }
        if self.initial_backoff > self.max_backoff {
            bail!("initial backoff exceeds max backoff");
        }
        if self.initial_backoff.is_zero() {
            bail!("initial backoff must be nonzero");
        }
        if !(0.0..=1.0).contains(&self.inject_delay_probability) {
            bail!("delay injection probability must be in 0..=1, was {}", self.inject_delay_probability);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        MessengerConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::empty_port_range(|c: &mut MessengerConfig| { c.bind_port_min = 7000; c.bind_port_max = 6999; })]
    #[case::backoff_inverted(|c: &mut MessengerConfig| { c.initial_backoff = Duration::from_secs(60); })]
    #[case::backoff_zero(|c: &mut MessengerConfig| { c.initial_backoff = Duration::ZERO; })]
    #[case::probability_out_of_range(|c: &mut MessengerConfig| { c.inject_delay_probability = 1.5; })]
    fn test_validate_rejects(#[case] tweak: fn(&mut MessengerConfig)) {
        let mut config = MessengerConfig::default();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }
}
