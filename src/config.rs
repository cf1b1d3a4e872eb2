use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{BusError, BusResult};
use crate::packet::HEADER_LEN;

/// Configuration for a bus instance. [`BusConfig::new`] fills in defaults
/// suitable for a LAN; [`BusConfig::validate`] is called by `open()`.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Multicast group to join and publish to.
    pub group_addr: Ipv4Addr,
    pub group_port: u16,

    /// Local interface address used for binding and for the multicast join.
    /// `0.0.0.0` lets the OS pick.
    pub bind_addr: Ipv4Addr,

    /// Period for sender heartbeats. A heartbeat is only sent when DATA has
    /// been published since the previous one.
    pub heartbeat_interval: Duration,

    /// Grace period before a freshly detected gap becomes NAK-eligible, to
    /// absorb plain reordering.
    pub nak_initial_delay: Duration,
    /// First re-NAK interval; doubles per retry up to `nak_backoff_cap`.
    pub nak_backoff_base: Duration,
    pub nak_backoff_cap: Duration,
    /// When a gap is still open this long after detection, it is declared
    /// permanently lost and surfaced as a `Loss` event.
    pub nak_deadline: Duration,

    /// Number of sent packets retained per bus for retransmission. Packets
    /// evicted from the ring are unrecoverable by retransmit.
    pub retransmit_ring_size: usize,

    /// Idle time after which per-peer receive state is reclaimed.
    pub peer_idle_timeout: Duration,

    /// Upper bound for a whole datagram including headers. Must fit the
    /// path MTU; the protocol never fragments.
    pub max_packet_bytes: usize,

    pub multicast_ttl: u32,
    /// Whether the host's own multicast sends are looped back locally. The
    /// bus filters its own packets either way.
    pub multicast_loop: bool,

    /// Symmetric key for payload encryption; `None` sends cleartext.
    pub cipher_key: Option<Vec<u8>>,
}

impl BusConfig {
    pub fn new(group_addr: Ipv4Addr, group_port: u16) -> BusConfig {
        BusConfig {
            group_addr,
            group_port,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            heartbeat_interval: Duration::from_secs(1),
            nak_initial_delay: Duration::from_millis(20),
            nak_backoff_base: Duration::from_millis(50),
            nak_backoff_cap: Duration::from_secs(1),
            nak_deadline: Duration::from_secs(5),
            retransmit_ring_size: 1024,
            peer_idle_timeout: Duration::from_secs(30),
            max_packet_bytes: 1400,
            multicast_ttl: 1,
            multicast_loop: true,
            cipher_key: None,
        }
    }

    pub fn validate(&self) -> BusResult<()> {
        if !self.group_addr.is_multicast() {
            return Err(BusError::Config(format!("{} is not a multicast address", self.group_addr)));
        }
        if self.retransmit_ring_size == 0 {
            return Err(BusError::Config("retransmit ring size must be positive".to_owned()));
        }
        if self.max_packet_bytes < HEADER_LEN + 64 || self.max_packet_bytes > 65507 {
            return Err(BusError::Config(format!(
                "max packet size {} is outside {}..=65507", self.max_packet_bytes, HEADER_LEN + 64
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(BusError::Config("heartbeat interval must be positive".to_owned()));
        }
        if self.nak_backoff_base.is_zero() || self.nak_backoff_cap < self.nak_backoff_base {
            return Err(BusError::Config("NAK backoff base must be positive and below the cap".to_owned()));
        }
        if self.nak_deadline < self.nak_initial_delay {
            return Err(BusError::Config("NAK deadline must not precede the initial delay".to_owned()));
        }
        if let Some(key) = &self.cipher_key {
            if key.is_empty() {
                return Err(BusError::InvalidKey);
            }
        }
        Ok(())
    }

    /// Granularity of the receive-side timer that drives NAK emission, loss
    /// deadlines and peer GC.
    pub(crate) fn timer_tick(&self) -> Duration {
        (self.nak_initial_delay / 2).max(Duration::from_millis(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn valid() -> BusConfig {
        BusConfig::new(Ipv4Addr::new(239, 1, 2, 3), 7400)
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(valid().validate().is_ok());
    }

    #[rstest]
    #[case::not_multicast(|c: &mut BusConfig| c.group_addr = Ipv4Addr::new(10, 0, 0, 1))]
    #[case::zero_ring(|c: &mut BusConfig| c.retransmit_ring_size = 0)]
    #[case::tiny_packet(|c: &mut BusConfig| c.max_packet_bytes = 32)]
    #[case::oversized_packet(|c: &mut BusConfig| c.max_packet_bytes = 100_000)]
    #[case::zero_heartbeat(|c: &mut BusConfig| c.heartbeat_interval = Duration::ZERO)]
    #[case::inverted_backoff(|c: &mut BusConfig| c.nak_backoff_cap = Duration::from_millis(1))]
    #[case::empty_key(|c: &mut BusConfig| c.cipher_key = Some(vec![]))]
    fn test_validate_rejects(#[case] break_it: fn(&mut BusConfig)) {
        let mut config = valid();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
