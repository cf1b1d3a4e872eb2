//! Reliable, ordered pub/sub messaging over IP multicast.
//!
//! Peer processes join a multicast group and exchange messages on
//! hierarchical dotted topics (`metrics.cpu`, `orders.emea.created`).
//! Subscribers register topic filters with wildcards (`metrics.>`,
//! `orders.*.created`) and receive matching messages with guarantees raw UDP
//! does not provide.
//!
//! ## Design goals
//!
//! * Every packet carries a per-(peer, session) sequence number. Receivers
//!   detect gaps, buffer out-of-order packets, and request retransmission
//!   with negative acknowledgements - there are no positive ACKs.
//! * Per publisher, delivery to the application is strictly in publish
//!   order. Across publishers there is no ordering.
//! * A gap that cannot be repaired (retransmit deadline passed, or the
//!   sender no longer retains the packets) is surfaced to the application as
//!   an explicit loss event naming the exact missing sequences, and delivery
//!   continues past it. Reliability is bounded by the sender's retransmit
//!   ring, not unbounded buffering.
//! * Periodic heartbeats announce the sender's highest assigned sequence, so
//!   receivers also notice loss at the tail of a burst.
//! * Sessions are ephemeral: a restarted publisher gets a fresh session id
//!   and a fresh sequence space, detected without any handshake.
//! * Payloads can optionally be protected with a symmetric Blowfish cipher
//!   (64-bit blocks, 32..448-bit key, ECB over PKCS#5-padded payloads).
//!
//! ## Wire format
//!
//! One packet per UDP datagram, all integers big-endian. Fixed 16-byte
//! header:
//!
//! ```ascii
//!  0: magic (u16) - 0x4D42
//!  2: protocol version (u8) - 1
//!  3: kind (u8) - DATA=1, NAK=2, HEARTBEAT=3
//!  4: peer id (u32)
//!  8: session id (u16)
//! 10: sequence (u32) - DATA: packet sequence; HEARTBEAT: highest assigned;
//!      NAK: request id
//! 14: flags (u16) - bit 0: encrypted payload, bit 1: unrecoverable NAK
//!      echo, bits 2..15 reserved (zero)
//! ```
//!
//! *DATA* body - topic length (u16, 1..=250), topic (UTF-8), payload length
//! (u32), payload (ciphertext when flag bit 0 is set).
//!
//! *NAK* body - target peer id (u32), target session id (u16), range count
//! (u16), then per range: first and last sequence (u32 each, inclusive).
//! NAKs travel unicast back to the publisher, and retransmitted packets
//! travel unicast back to the requester, to avoid multicast amplification.
//! A NAK with the unrecoverable flag set is a publisher's reply naming the
//! ranges it no longer retains.
//!
//! *HEARTBEAT* body - empty; the announced sequence sits in the header.
//!
//! ## Usage
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use mcastbus::{Bus, BusConfig, Delivery, MessageHandler};
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Printer {
//!     async fn on_message(&self, delivery: Delivery) -> anyhow::Result<()> {
//!         println!("{}: {} bytes", delivery.topic, delivery.payload.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let bus = Bus::open(BusConfig::new(Ipv4Addr::new(239, 1, 2, 3), 7400)).await?;
//! bus.subscribe("metrics.>", Arc::new(Printer))?;
//! bus.publish("metrics.cpu", &[0x01]).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cipher;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod packet;
mod peer_tracker;
mod retransmit;
mod send_pipeline;
pub mod seq;
pub mod topic;

pub use bus::Bus;
pub use cipher::MessageCipher;
pub use config::BusConfig;
pub use dispatcher::{Delivery, Loss, MessageHandler, SubscriptionId};
pub use error::{BusError, BusResult};
pub use metrics::MetricsSnapshot;
pub use seq::{Seq, SeqRange};
pub use topic::TopicFilter;
