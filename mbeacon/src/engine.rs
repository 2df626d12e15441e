//! Beacon orchestration: receive dispatch, timer-driven probing and
//! reporting, garbage collection and bandwidth accounting.
//!
//! All mutable daemon state lives here, owned by one thread. Every method
//! takes the current time in milliseconds, so the whole engine runs against
//! a synthetic clock in tests.

use std::process::Child;

use crate::addr::Address;
use crate::config::{BeaconConfig, DEFAULT_BEACON_INTERVAL_SECS};
use crate::dump;
use crate::protocol::{self, ReportKind};
use crate::source::SourceTable;
use crate::ssm::SsmGroupManager;
use crate::timer::{EventScheduler, TimerKind};
use crate::transport::{Datagram, SocketKind, Transport};
use crate::util;

/// Probes per burst before the sender backs off to a randomized gap.
pub const PROBE_BURST_COUNT: u32 = 10;
/// Spacing between probes inside a burst.
pub const PROBE_SPACING_MS: u64 = 100;
/// Sources and their stats go stale after this many beacon intervals.
pub const SOURCE_TIMEOUT_INTERVALS: f64 = 6.0;

const GC_INTERVAL_MS: u64 = 30_000;
const BW_TICK_MS: u64 = 10_000;
const BW_SUMMARY_MS: u64 = 600_000;

// First-fire delays; afterwards each report kind re-arms at its own
// multiple of the beacon interval.
const STATS_REPORT_START_MS: u64 = 10_000;
const SSM_REPORT_START_MS: u64 = 15_000;
const MAP_REPORT_START_MS: u64 = 30_000;
const WEBSITE_REPORT_START_MS: u64 = 120_000;

/// The complete beacon: source table, SSM membership, scheduler, counters
/// and the transport everything goes out through.
pub struct BeaconEngine<T: Transport> {
    cfg: BeaconConfig,
    transport: T,
    scheduler: EventScheduler,
    table: SourceTable,
    ssm: SsmGroupManager,
    /// Probe group plus any extra redistribution addresses.
    report_targets: Vec<Address>,
    beacon_interval_secs: f64,
    probe_seq: u32,
    ssm_probe_seq: u32,
    probe_burst: u32,
    ssm_probe_burst: u32,
    // Byte counters: current 10s window, dump window, 10min aggregate.
    bytes_rx: u64,
    bytes_tx: u64,
    dump_rx: u64,
    dump_tx: u64,
    dump_since: u64,
    big_rx: u64,
    big_tx: u64,
    big_since: u64,
    start: u64,
    children: Vec<Child>,
}

impl<T: Transport> BeaconEngine<T> {
    /// Builds the engine and arms the initial timer set. The first website
    /// report goes out immediately so peers learn who we are without
    /// waiting two minutes.
    pub fn new(cfg: BeaconConfig, mut transport: T, now: u64) -> Self {
        if let Err(e) = transport.set_multicast_hop_limit(cfg.ttl) {
            log::warn!("failed to set multicast hop limit: {}", e);
        }

        let mut scheduler = EventScheduler::new(now);
        let mut report_targets = Vec::new();

        if let Some(group) = cfg.probe_group {
            report_targets.push(group);
            scheduler.insert(TimerKind::ProbeSend, PROBE_SPACING_MS);
            scheduler.insert(TimerKind::StatsReport, STATS_REPORT_START_MS);
            scheduler.insert(TimerKind::MapReport, MAP_REPORT_START_MS);
            scheduler.insert(TimerKind::WebsiteReport, WEBSITE_REPORT_START_MS);
            if cfg.ssm_group.is_some() {
                scheduler.insert(TimerKind::SsmReport, SSM_REPORT_START_MS);
            }
        }
        report_targets.extend(cfg.redistribute.iter().copied());

        if cfg.ssm_group.is_some() {
            scheduler.insert(TimerKind::SsmProbeSend, PROBE_SPACING_MS);
        }
        scheduler.insert(TimerKind::GarbageCollect, GC_INTERVAL_MS);
        if cfg.dump_file.is_some() {
            scheduler.insert(TimerKind::Dump, cfg.dump_interval_secs * 1000);
        }
        scheduler.insert(TimerKind::BandwidthTick, BW_TICK_MS);
        if cfg.bandwidth_report {
            scheduler.insert(TimerKind::BandwidthSummary, BW_SUMMARY_MS);
        }

        let mut engine = Self {
            cfg,
            transport,
            scheduler,
            table: SourceTable::new(),
            ssm: SsmGroupManager::new(),
            report_targets,
            beacon_interval_secs: DEFAULT_BEACON_INTERVAL_SECS,
            probe_seq: rand::random(),
            ssm_probe_seq: rand::random(),
            probe_burst: 0,
            ssm_probe_burst: 0,
            bytes_rx: 0,
            bytes_tx: 0,
            dump_rx: 0,
            dump_tx: 0,
            dump_since: now,
            big_rx: 0,
            big_tx: 0,
            big_since: now,
            start: now,
            children: Vec::new(),
        };

        engine.send_report(ReportKind::Website, now);
        engine
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.cfg
    }

    pub fn table(&self) -> &SourceTable {
        &self.table
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Current (adaptive) beacon interval in seconds.
    pub fn beacon_interval_secs(&self) -> f64 {
        self.beacon_interval_secs
    }

    /// Staleness timeout applied to sources, stats and external entries.
    pub fn source_timeout_ms(&self) -> u64 {
        (SOURCE_TIMEOUT_INTERVALS * self.beacon_interval_secs * 1000.0) as u64
    }

    /// How long the next blocking wait may last, in milliseconds.
    pub fn next_timeout_ms(&mut self, now: u64) -> u64 {
        self.scheduler.time_until_next(now)
    }

    /// Feeds one received datagram through decode and the statistics path.
    pub fn on_datagram(&mut self, kind: SocketKind, dgram: &Datagram) {
        // Our own multicast traffic loops back; skip it.
        if dgram.from.same_host(&self.cfg.unicast) {
            return;
        }
        self.bytes_rx += dgram.payload.len() as u64;

        let received = protocol::handle_message(
            &self.cfg,
            &mut self.table,
            &mut self.ssm,
            &mut self.transport,
            &dgram.from,
            dgram.timestamp,
            dgram.hop_limit,
            &dgram.payload,
            kind == SocketKind::SsmProbe,
        );
        log::trace!(
            "datagram from {} on {:?}: {} bytes, {:?}",
            dgram.from,
            kind,
            dgram.payload.len(),
            received
        );
    }

    /// Fires every due timer and re-arms per type. Call after every wait,
    /// whether it timed out or I/O was ready.
    pub fn run_due(&mut self, now: u64) {
        let fired = self.scheduler.fire_due(now);
        for kind in fired {
            self.handle_timer(kind, now);
        }
        self.reap_children();
    }

    fn handle_timer(&mut self, kind: TimerKind, now: u64) {
        log::trace!("timer {:?}", kind);
        match kind {
            TimerKind::ProbeSend => {
                self.send_probe(now);
                self.probe_burst += 1;
                if self.probe_burst >= PROBE_BURST_COUNT {
                    self.scheduler.insert(
                        TimerKind::ProbeBurstGap,
                        util::exp_interval_ms(self.beacon_interval_secs * 1000.0),
                    );
                } else {
                    self.scheduler.insert(TimerKind::ProbeSend, PROBE_SPACING_MS);
                }
            }
            TimerKind::ProbeBurstGap => {
                self.probe_burst = 0;
                self.scheduler.insert(TimerKind::ProbeSend, PROBE_SPACING_MS);
            }
            TimerKind::SsmProbeSend => {
                self.send_ssm_probe(now);
                self.ssm_probe_burst += 1;
                if self.ssm_probe_burst >= PROBE_BURST_COUNT {
                    self.scheduler.insert(
                        TimerKind::SsmProbeBurstGap,
                        util::exp_interval_ms(self.beacon_interval_secs * 1000.0),
                    );
                } else {
                    self.scheduler
                        .insert(TimerKind::SsmProbeSend, PROBE_SPACING_MS);
                }
            }
            TimerKind::SsmProbeBurstGap => {
                self.ssm_probe_burst = 0;
                self.scheduler
                    .insert(TimerKind::SsmProbeSend, PROBE_SPACING_MS);
            }
            TimerKind::StatsReport => {
                self.send_report(ReportKind::Stats, now);
                self.rearm_report(kind, 2.0);
            }
            TimerKind::SsmReport => {
                self.send_ssm_report(now);
                self.rearm_report(kind, 3.0);
            }
            TimerKind::MapReport => {
                self.send_report(ReportKind::Map, now);
                self.rearm_report(kind, 6.0);
            }
            TimerKind::WebsiteReport => {
                self.send_report(ReportKind::Website, now);
                self.rearm_report(kind, 24.0);
            }
            TimerKind::GarbageCollect => {
                self.garbage_collect(now);
                self.scheduler.insert(kind, GC_INTERVAL_MS);
            }
            TimerKind::Dump => {
                self.write_dump(now);
                self.scheduler
                    .insert(kind, self.cfg.dump_interval_secs * 1000);
            }
            TimerKind::BandwidthTick => {
                self.bandwidth_tick();
                self.scheduler.insert(kind, BW_TICK_MS);
            }
            TimerKind::BandwidthSummary => {
                self.bandwidth_summary(now, true);
                self.scheduler.insert(kind, BW_SUMMARY_MS);
            }
        }
    }

    fn rearm_report(&mut self, kind: TimerKind, multiple: f64) {
        let interval = (multiple * self.beacon_interval_secs * 1000.0).ceil() as u64;
        self.scheduler.insert(kind, interval);
    }

    fn send_probe(&mut self, now: u64) {
        let Some(group) = self.cfg.probe_group else {
            return;
        };
        match protocol::build_probe(self.probe_seq, now) {
            Ok(buf) => {
                self.probe_seq = self.probe_seq.wrapping_add(1);
                self.send_to(&buf, &group);
            }
            Err(e) => log::warn!("probe encode failed: {}", e),
        }
    }

    fn send_ssm_probe(&mut self, now: u64) {
        let Some(group) = self.cfg.ssm_group else {
            return;
        };
        match protocol::build_probe(self.ssm_probe_seq, now) {
            Ok(buf) => {
                self.ssm_probe_seq = self.ssm_probe_seq.wrapping_add(1);
                self.send_to(&buf, &group);
            }
            Err(e) => log::warn!("probe encode failed: {}", e),
        }
    }

    fn send_report(&mut self, kind: ReportKind, now: u64) {
        match protocol::build_report(&self.cfg, &self.table, kind, true, now) {
            Ok(buf) => {
                let targets = self.report_targets.clone();
                for to in &targets {
                    log::debug!("sending {:?} report to {}", kind, to);
                    self.send_to(&buf, to);
                }
            }
            Err(e) => log::warn!("report encode failed, skipping this cycle: {}", e),
        }
    }

    /// The SSM channel gets a plain identity report without sources.
    fn send_ssm_report(&mut self, now: u64) {
        let Some(group) = self.cfg.ssm_group else {
            return;
        };
        match protocol::build_report(&self.cfg, &self.table, ReportKind::Stats, false, now) {
            Ok(buf) => self.send_to(&buf, &group),
            Err(e) => log::warn!("report encode failed, skipping this cycle: {}", e),
        }
    }

    /// Best-effort leave announcement; called once on shutdown.
    pub fn send_leave_report(&mut self, now: u64) {
        match protocol::build_report(&self.cfg, &self.table, ReportKind::Leave, false, now) {
            Ok(buf) => {
                let targets = self.report_targets.clone();
                for to in &targets {
                    self.send_to(&buf, to);
                }
            }
            Err(e) => log::warn!("leave report encode failed: {}", e),
        }
    }

    fn send_to(&mut self, buf: &[u8], to: &Address) {
        match self.transport.send(buf, to) {
            Ok(n) => self.bytes_tx += n as u64,
            Err(e) => log::warn!("send to {} failed: {}", to, e),
        }
    }

    fn garbage_collect(&mut self, now: u64) {
        let timeout = self.source_timeout_ms();
        let expired = self.table.garbage_collect(now, timeout);
        for key in expired {
            if let Some(src) = self.table.remove(&key, true) {
                self.ssm.leave_if_active(
                    &mut self.transport,
                    self.cfg.ssm_group.as_ref(),
                    &src.addr,
                );
            }
        }
    }

    /// Rolls the 10-second byte window into the aggregates and adapts the
    /// beacon interval to the observed traffic: busier groups probe less
    /// often.
    fn bandwidth_tick(&mut self) {
        let rx_kbps = self.bytes_rx as f64 * 8.0 / (BW_TICK_MS as f64);
        let tx_kbps = self.bytes_tx as f64 * 8.0 / (BW_TICK_MS as f64);

        if self.cfg.bandwidth_report {
            log::info!(
                "bw: received {} bytes ({:.2} kbit/s), sent {} bytes ({:.2} kbit/s)",
                self.bytes_rx,
                rx_kbps,
                self.bytes_tx,
                tx_kbps
            );
        }

        self.big_rx += self.bytes_rx;
        self.big_tx += self.bytes_tx;
        self.dump_rx += self.bytes_rx;
        self.dump_tx += self.bytes_tx;
        self.bytes_rx = 0;
        self.bytes_tx = 0;

        let rate = rx_kbps.max(4.0);
        self.beacon_interval_secs = 4.0 * (rate.ln() / 1.38);
    }

    /// Prints the long-window aggregate counters; `reset` restarts the
    /// window (the periodic timer does, the SIGUSR1 path does not).
    pub fn bandwidth_summary(&mut self, now: u64, reset: bool) {
        let secs = (now.saturating_sub(self.big_since) / 1000).max(1);
        log::info!(
            "bw usage for {} secs: rx {} bytes ({:.2} kbit/s) tx {} bytes ({:.2} kbit/s)",
            secs,
            self.big_rx,
            self.big_rx as f64 * 8.0 / (secs as f64 * 1000.0),
            self.big_tx,
            self.big_tx as f64 * 8.0 / (secs as f64 * 1000.0)
        );
        if reset {
            self.big_rx = 0;
            self.big_tx = 0;
            self.big_since = now;
        }
    }

    fn write_dump(&mut self, now: u64) {
        let Some(path) = self.cfg.dump_file.clone() else {
            return;
        };

        let diff = now.saturating_sub(self.dump_since).max(1);
        let rx_rate = self.dump_rx as f64 * 8.0 / diff as f64;
        let tx_rate = self.dump_tx as f64 * 8.0 / diff as f64;
        self.dump_rx = 0;
        self.dump_tx = 0;
        self.dump_since = now;

        let snapshot = dump::DumpInfo {
            now,
            start: self.start,
            beacon_interval_secs: self.beacon_interval_secs,
            rx_rate_kbps: rx_rate,
            tx_rate_kbps: tx_rate,
        };
        if let Err(e) = dump::write_dump(&path, &self.cfg, &self.table, &snapshot) {
            log::warn!("status dump to {} failed: {}", path.display(), e);
            return;
        }

        if let Some(program) = &self.cfg.launch_after_dump {
            match dump::launch_notifier(program, &path) {
                Ok(child) => self.children.push(child),
                Err(e) => log::warn!("failed to launch {}: {}", program, e),
            }
        }
    }

    /// Reaps finished post-dump notifier children without blocking.
    fn reap_children(&mut self) {
        self.children
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn probing_config() -> BeaconConfig {
        BeaconConfig {
            name: "engine-test".into(),
            admin_contact: "op@example.net".into(),
            probe_group: Some(addr("224.0.23.10/10000")),
            unicast: addr("10.0.0.100/10000"),
            ..BeaconConfig::default()
        }
    }

    /// Steps the engine's clock until `pred` holds or the deadline passes.
    fn run_until<F>(engine: &mut BeaconEngine<RecordingTransport>, mut now: u64, deadline: u64, mut pred: F) -> u64
    where
        F: FnMut(&mut BeaconEngine<RecordingTransport>) -> bool,
    {
        while now < deadline && !pred(engine) {
            now += engine.next_timeout_ms(now);
            engine.run_due(now);
        }
        now
    }

    #[test]
    fn test_startup_announces_identity() {
        let engine = BeaconEngine::new(probing_config(), RecordingTransport::new(), 0);
        // The initial website report went to the probe group.
        assert_eq!(engine.transport.sent.len(), 1);
        assert_eq!(engine.transport.sent[0].1, addr("224.0.23.10/10000"));
    }

    #[test]
    fn test_probe_bursts_pause_after_ten() {
        let mut engine = BeaconEngine::new(probing_config(), RecordingTransport::new(), 0);
        engine.transport.take_sent();

        // One burst: ten probes at 100ms spacing.
        let mut now = 0;
        for _ in 0..PROBE_BURST_COUNT {
            now += engine.next_timeout_ms(now);
            engine.run_due(now);
        }
        let sent = engine.transport.take_sent();
        let probes = sent
            .iter()
            .filter(|(buf, _)| buf.len() == protocol::PROBE_LEN)
            .count();
        assert_eq!(probes as u32, PROBE_BURST_COUNT);
        assert_eq!(now, 1000);

        // The next probe only comes after the randomized gap.
        let resumed = run_until(&mut engine, now, now + 600_000, |e| {
            !e.transport.sent.is_empty()
        });
        assert!(resumed > now + 1);
    }

    #[test]
    fn test_sequence_numbers_increment() {
        let mut engine = BeaconEngine::new(probing_config(), RecordingTransport::new(), 0);
        engine.transport.take_sent();
        let mut now = 0;
        for _ in 0..3 {
            now += engine.next_timeout_ms(now);
            engine.run_due(now);
        }
        let sent = engine.transport.take_sent();
        let seqs: Vec<u32> = sent
            .iter()
            .filter(|(buf, _)| buf.len() == protocol::PROBE_LEN)
            .map(|(buf, _)| u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]))
            .collect();
        assert!(seqs.len() >= 2);
        assert_eq!(seqs[1], seqs[0].wrapping_add(1));
    }

    #[test]
    fn test_own_traffic_ignored() {
        let mut engine = BeaconEngine::new(probing_config(), RecordingTransport::new(), 0);
        let probe = protocol::build_probe(1, 0).unwrap();
        let dgram = Datagram {
            payload: probe,
            from: addr("10.0.0.100/32000"), // same host, different port
            to: addr("224.0.23.10/10000"),
            hop_limit: 127,
            timestamp: 50,
        };
        engine.on_datagram(SocketKind::Probe, &dgram);
        assert!(engine.table().is_empty());
    }

    #[test]
    fn test_gc_expires_and_leaves() {
        let mut cfg = probing_config();
        cfg.ssm_group = Some(addr("232.2.3.2/10000"));
        let mut engine = BeaconEngine::new(cfg, RecordingTransport::new(), 0);

        let probe = protocol::build_probe(1, 0).unwrap();
        let dgram = Datagram {
            payload: probe,
            from: addr("10.0.0.1/5000"),
            to: addr("224.0.23.10/10000"),
            hop_limit: 127,
            timestamp: 0,
        };
        engine.on_datagram(SocketKind::Probe, &dgram);
        assert_eq!(engine.table().len(), 1);
        assert_eq!(engine.transport.ssm_joins.len(), 1);

        // Quiet long past the timeout: the source is collected and the SSM
        // reference released.
        let deadline = engine.source_timeout_ms() + GC_INTERVAL_MS + 1000;
        run_until(&mut engine, 0, deadline, |e| e.table().is_empty());
        assert!(engine.table().is_empty());
        assert_eq!(engine.transport.ssm_leaves.len(), 1);
        assert_eq!(
            engine.transport.ssm_leaves[0],
            (addr("232.2.3.2/10000"), addr("10.0.0.1/0"))
        );
    }

    #[test]
    fn test_interval_adapts_to_traffic() {
        let mut engine = BeaconEngine::new(probing_config(), RecordingTransport::new(), 0);
        let idle_interval = {
            let mut e = BeaconEngine::new(probing_config(), RecordingTransport::new(), 0);
            e.run_due(BW_TICK_MS + 1);
            e.beacon_interval_secs()
        };

        // Push ~100 kbit/s through the receive counter.
        let dgram = Datagram {
            payload: vec![0u8; 1250],
            from: addr("10.0.0.9/5000"),
            to: addr("224.0.23.10/10000"),
            hop_limit: 127,
            timestamp: 0,
        };
        for _ in 0..100 {
            engine.on_datagram(SocketKind::Probe, &dgram);
        }
        engine.run_due(BW_TICK_MS + 1);

        assert!(engine.beacon_interval_secs() > idle_interval);
    }

    #[test]
    fn test_leave_report_on_shutdown() {
        let mut engine = BeaconEngine::new(probing_config(), RecordingTransport::new(), 0);
        engine.transport.take_sent();
        engine.send_leave_report(0);
        let sent = engine.transport.take_sent();
        assert_eq!(sent.len(), 1);
        // The leave marker tag is present in the TLV stream.
        assert!(sent[0].0.windows(2).any(|w| w == [protocol::tag::LEAVE, 0]));
    }

    #[test]
    fn test_failed_sends_are_skipped_not_fatal() {
        let mut transport = RecordingTransport::new();
        transport.fail_sends = true;
        let mut engine = BeaconEngine::new(probing_config(), transport, 0);
        let mut now = 0;
        for _ in 0..5 {
            now += engine.next_timeout_ms(now);
            engine.run_due(now);
        }
        // Nothing sent, nothing crashed, timers still armed.
        assert!(engine.transport.sent.is_empty());
        assert!(engine.next_timeout_ms(now) >= 1);
    }
}
