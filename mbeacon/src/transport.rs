//! The network capability boundary.
//!
//! The engine sends packets and manages group membership exclusively through
//! [`Transport`]; it never opens sockets itself. The real POSIX
//! implementation lives in [`crate::socket`], and [`RecordingTransport`]
//! stands in for it in tests and examples.

use crate::addr::Address;
use std::io;

/// Which listening socket a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// The ASM probe group.
    Probe,
    /// The SSM probe channel.
    SsmProbe,
    /// A unicast report listener.
    Report,
}

/// One received datagram plus its metadata.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub from: Address,
    pub to: Address,
    /// Remaining hop limit / TTL as received, when the platform reports it.
    pub hop_limit: u8,
    /// Local receipt time in milliseconds.
    pub timestamp: u64,
}

/// Datagram send and multicast membership operations.
pub trait Transport {
    fn send(&mut self, payload: &[u8], to: &Address) -> io::Result<usize>;
    fn join_group(&mut self, group: &Address) -> io::Result<()>;
    fn leave_group(&mut self, group: &Address) -> io::Result<()>;
    fn join_source_group(&mut self, group: &Address, source: &Address) -> io::Result<()>;
    fn leave_source_group(&mut self, group: &Address, source: &Address) -> io::Result<()>;
    fn set_multicast_hop_limit(&mut self, hops: u8) -> io::Result<()>;
}

/// In-memory transport recording every call it receives.
///
/// The unit and integration tests assert against the recorded traffic, and
/// the `loopback` example uses it to wire two engines together without
/// touching the network.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<(Vec<u8>, Address)>,
    pub joins: Vec<Address>,
    pub leaves: Vec<Address>,
    pub ssm_joins: Vec<(Address, Address)>,
    pub ssm_leaves: Vec<(Address, Address)>,
    pub hop_limit: Option<u8>,
    /// When set, sends fail with an I/O error to exercise skip paths.
    pub fail_sends: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns everything sent so far.
    pub fn take_sent(&mut self) -> Vec<(Vec<u8>, Address)> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, payload: &[u8], to: &Address) -> io::Result<usize> {
        if self.fail_sends {
            return Err(io::Error::new(io::ErrorKind::Other, "send disabled"));
        }
        self.sent.push((payload.to_vec(), *to));
        Ok(payload.len())
    }

    fn join_group(&mut self, group: &Address) -> io::Result<()> {
        self.joins.push(*group);
        Ok(())
    }

    fn leave_group(&mut self, group: &Address) -> io::Result<()> {
        self.leaves.push(*group);
        Ok(())
    }

    fn join_source_group(&mut self, group: &Address, source: &Address) -> io::Result<()> {
        self.ssm_joins.push((*group, *source));
        Ok(())
    }

    fn leave_source_group(&mut self, group: &Address, source: &Address) -> io::Result<()> {
        self.ssm_leaves.push((*group, *source));
        Ok(())
    }

    fn set_multicast_hop_limit(&mut self, hops: u8) -> io::Result<()> {
        self.hop_limit = Some(hops);
        Ok(())
    }
}
