//! # mbeacon
//!
//! A multicast beacon: every instance periodically sends small UDP probe
//! packets to a multicast group and exchanges aggregated quality reports
//! (loss, delay, jitter, duplication, reordering) with every other beacon it
//! hears, including sources it only learns about second-hand. Together the
//! beacons measure end-to-end multicast reachability without any central
//! coordination.
//!
//! ## Features
//!
//! - **Binary TLV wire protocol** with defensive, bounds-checked decoding
//! - **Sliding-window statistics** per source and mode (ASM/SSM):
//!   RFC 3550 style jitter, loss, one-way delay, duplicates, reordering
//! - **Delta-queue scheduler**: periodic work without per-tick clock polling
//! - **Reference-counted SSM joins** driven by source-table churn
//! - **Timeout-based garbage collection** of sources and relayed statistics
//! - **Adaptive probing interval** derived from observed group traffic
//! - **Periodic XML status dumps** with optional post-dump notifier
//!
//! ## Quick Start
//!
//! ```no_run
//! use mbeacon::prelude::*;
//!
//! let cfg = BeaconConfig {
//!     name: "my-beacon".into(),
//!     admin_contact: "op@example.net".into(),
//!     probe_group: Some("224.0.23.10/10000".parse().unwrap()),
//!     ..BeaconConfig::default()
//! };
//! cfg.validate().unwrap();
//!
//! let (transport, unicast) = UdpTransport::new(&cfg).unwrap();
//! let cfg = BeaconConfig { unicast, ..cfg };
//! let mut engine = BeaconEngine::new(cfg, transport, mbeacon::util::now_millis());
//!
//! loop {
//!     let now = mbeacon::util::now_millis();
//!     let timeout = engine.next_timeout_ms(now);
//!     let ready = engine.transport_mut().poll(timeout).unwrap();
//!     for idx in ready {
//!         let kind = engine.transport_mut().kind(idx);
//!         while let Some(dgram) = engine.transport_mut().recv(idx).unwrap() {
//!             engine.on_datagram(kind, &dgram);
//!         }
//!     }
//!     engine.run_due(mbeacon::util::now_millis());
//! }
//! ```

pub mod addr;
pub mod config;
pub mod dump;
pub mod engine;
pub mod protocol;
#[cfg(unix)]
pub mod socket;
pub mod source;
pub mod ssm;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod util;
pub mod wire;

pub use addr::{Address, AddressParseError};
pub use config::{BeaconConfig, ConfigError};
pub use engine::BeaconEngine;
pub use protocol::{ReportKind, Received};
#[cfg(unix)]
pub use socket::UdpTransport;
pub use source::{BeaconSource, ExternalStats, SourceTable};
pub use ssm::SsmGroupManager;
pub use stats::{McastState, Stats};
pub use timer::{EventScheduler, TimerKind};
pub use transport::{Datagram, RecordingTransport, SocketKind, Transport};
pub use wire::{ByteCursor, ByteWriter, WireError};

use std::fmt;
use std::io;

/// Unified error type encompassing all mbeacon error variants.
#[derive(Debug)]
pub enum BeaconError {
    Config(ConfigError),
    Wire(WireError),
    Address(AddressParseError),
    Io(io::Error),
}

impl fmt::Display for BeaconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeaconError::Config(e) => write!(f, "configuration error: {}", e),
            BeaconError::Wire(e) => write!(f, "wire error: {}", e),
            BeaconError::Address(e) => write!(f, "address error: {}", e),
            BeaconError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for BeaconError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BeaconError::Config(e) => Some(e),
            BeaconError::Wire(e) => Some(e),
            BeaconError::Address(e) => Some(e),
            BeaconError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for BeaconError {
    fn from(err: ConfigError) -> Self {
        BeaconError::Config(err)
    }
}

impl From<WireError> for BeaconError {
    fn from(err: WireError) -> Self {
        BeaconError::Wire(err)
    }
}

impl From<AddressParseError> for BeaconError {
    fn from(err: AddressParseError) -> Self {
        BeaconError::Address(err)
    }
}

impl From<io::Error> for BeaconError {
    fn from(err: io::Error) -> Self {
        BeaconError::Io(err)
    }
}

/// Prelude: import everything commonly needed.
pub mod prelude {
    pub use crate::{
        Address, BeaconConfig, BeaconEngine, BeaconError, Datagram, RecordingTransport,
        ReportKind, SocketKind, SourceTable, Transport,
    };
    #[cfg(unix)]
    pub use crate::UdpTransport;
}
