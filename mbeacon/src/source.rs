//! Known-source bookkeeping: per-beacon state, relayed third-party
//! statistics, and timeout-based garbage collection.

use crate::addr::Address;
use crate::stats::{McastState, Stats};
use std::collections::BTreeMap;

/// Announced websites, keyed by the wire tag of the website category.
pub type WebSites = BTreeMap<u8, String>;

/// Statistics another beacon reported about a third-party source. These are
/// relayed summaries, never computed locally from raw packets.
#[derive(Debug, Clone, Default)]
pub struct ExternalStats {
    /// Age in seconds as measured by the reporting beacon.
    pub age: u32,
    /// When we last heard about this source via a report.
    pub lastupdate: u64,
    pub identified: bool,
    pub name: String,
    pub contact: String,
    /// Capability flags as relayed.
    pub flags: u32,
    pub asm: Stats,
    pub ssm: Stats,
}

/// Everything known about one beacon heard on the wire.
#[derive(Debug, Clone)]
pub struct BeaconSource {
    /// Full first-seen endpoint, port intact; the table key strips the port.
    pub addr: Address,
    pub name: String,
    pub admin_contact: String,
    pub country: String,
    pub identified: bool,
    pub creation: u64,
    /// Last time anything referenced this source.
    pub lastevent: u64,
    /// Last time a probe or report arrived from it directly.
    pub lastlocalevent: u64,
    /// Sender-announced original hop limit.
    pub sttl: u8,
    pub flags: u32,
    pub websites: WebSites,
    pub asm: McastState,
    pub ssm: McastState,
    pub external_sources: BTreeMap<Address, ExternalStats>,
}

impl BeaconSource {
    fn new(addr: Address, now: u64) -> Self {
        Self {
            addr,
            name: String::new(),
            admin_contact: String::new(),
            country: String::new(),
            identified: false,
            creation: now,
            lastevent: now,
            lastlocalevent: 0,
            sttl: 0,
            flags: 0,
            websites: WebSites::new(),
            asm: McastState::default(),
            ssm: McastState::default(),
            external_sources: BTreeMap::new(),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.identified = true;
    }

    /// Routes one accepted probe into the per-mode window.
    pub fn update(&mut self, ttl: u8, seqnum: u32, timestamp: u64, now: u64, via_ssm: bool) {
        log::trace!(
            "beacon({}{}) update seq={} ts={} now={}",
            self.name,
            if via_ssm { "/SSM" } else { "" },
            seqnum,
            timestamp,
            now
        );
        let st = if via_ssm { &mut self.ssm } else { &mut self.asm };
        st.update(ttl, seqnum, timestamp, now);
    }

    /// The relayed-stats slot for `addr`, created on first reference and
    /// stamped with the receipt time either way.
    pub fn external(&mut self, addr: Address, now: u64) -> &mut ExternalStats {
        if !self.external_sources.contains_key(&addr) {
            log::debug!("adding external source {} via {}", addr, self.addr);
        }
        let ext = self.external_sources.entry(addr).or_default();
        ext.lastupdate = now;
        ext
    }

    /// True while this source has been heard directly (not just via
    /// third-party reports) within the timeout.
    pub fn rx_local(&self, now: u64, timeout_ms: u64) -> bool {
        self.lastlocalevent != 0 && now.saturating_sub(self.lastlocalevent) <= timeout_ms
    }
}

/// The table of every source this beacon currently knows about.
///
/// Keys are port-stripped addresses (two beacons on one host share an
/// entry); the stored entry keeps the full first-seen address for wire
/// encoding.
#[derive(Debug, Default)]
pub struct SourceTable {
    map: BTreeMap<Address, BeaconSource>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, addr: &Address) -> Option<&BeaconSource> {
        self.map.get(&addr.strip_port())
    }

    pub fn get_mut(&mut self, addr: &Address) -> Option<&mut BeaconSource> {
        self.map.get_mut(&addr.strip_port())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &BeaconSource)> {
        self.map.iter()
    }

    /// Returns the entry for `addr`, refreshing its event stamps, creating
    /// it first if needed. The `bool` reports creation so the caller can
    /// issue the matching SSM join.
    pub fn get_or_create(
        &mut self,
        addr: &Address,
        name: Option<&str>,
        now: u64,
        local: bool,
    ) -> (&mut BeaconSource, bool) {
        use std::collections::btree_map::Entry;

        match self.map.entry(addr.strip_port()) {
            Entry::Occupied(e) => {
                let src = e.into_mut();
                src.lastevent = now;
                if local {
                    src.lastlocalevent = now;
                }
                (src, false)
            }
            Entry::Vacant(e) => {
                match name {
                    Some(name) => log::info!("adding source {} [{}]", addr, name),
                    None => log::info!("adding source {}", addr),
                }
                let mut src = BeaconSource::new(*addr, now);
                if local {
                    src.lastlocalevent = now;
                }
                if let Some(name) = name {
                    src.set_name(name);
                }
                (e.insert(src), true)
            }
        }
    }

    /// Removes `addr`'s entry, returning it so the caller can issue the
    /// matching SSM leave.
    pub fn remove(&mut self, addr: &Address, timeout: bool) -> Option<BeaconSource> {
        let removed = self.map.remove(&addr.strip_port());
        if let Some(src) = &removed {
            if src.identified {
                log::info!(
                    "removing source {} [{}]{}",
                    src.addr,
                    src.name,
                    if timeout { " by timeout" } else { "" }
                );
            } else {
                log::info!(
                    "removing source {}{}",
                    src.addr,
                    if timeout { " by timeout" } else { "" }
                );
            }
        }
        removed
    }

    /// One garbage-collection pass.
    ///
    /// Sources stale beyond `timeout_ms` are returned as expired for the
    /// caller to remove (and leave); surviving entries have stale per-mode
    /// stats invalidated and stale external entries pruned under the same
    /// timeout applied to their `lastupdate`.
    pub fn garbage_collect(&mut self, now: u64, timeout_ms: u64) -> Vec<Address> {
        let mut expired = Vec::new();
        for (key, src) in self.map.iter_mut() {
            if now.saturating_sub(src.lastevent) > timeout_ms {
                expired.push(*key);
                continue;
            }

            src.asm.s.check_validity(now, timeout_ms);
            src.ssm.s.check_validity(now, timeout_ms);

            src.external_sources
                .retain(|_, ext| now.saturating_sub(ext.lastupdate) <= timeout_ms);
            for ext in src.external_sources.values_mut() {
                ext.asm.check_validity(now, timeout_ms);
                ext.ssm.check_validity(now, timeout_ms);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_get_or_create_refreshes_stamps() {
        let mut table = SourceTable::new();
        let a = addr("10.0.0.1/5000");

        let (src, created) = table.get_or_create(&a, Some("beacon-a"), 100, true);
        assert!(created);
        assert!(src.identified);
        assert_eq!(src.creation, 100);
        assert_eq!(src.lastlocalevent, 100);

        let (src, created) = table.get_or_create(&a, None, 250, false);
        assert!(!created);
        assert_eq!(src.lastevent, 250);
        // Not locally observed this time.
        assert_eq!(src.lastlocalevent, 100);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_keying_ignores_port() {
        let mut table = SourceTable::new();
        let (_, created) = table.get_or_create(&addr("10.0.0.1/5000"), None, 1, true);
        assert!(created);
        let (src, created) = table.get_or_create(&addr("10.0.0.1/6000"), None, 2, true);
        assert!(!created);
        // The entry keeps the first-seen endpoint.
        assert_eq!(src.addr, addr("10.0.0.1/5000"));
    }

    #[test]
    fn test_gc_expires_stale_sources() {
        let mut table = SourceTable::new();
        table.get_or_create(&addr("10.0.0.1/5000"), None, 0, true);
        table.get_or_create(&addr("10.0.0.2/5000"), None, 25_000, true);

        let expired = table.garbage_collect(31_000, 30_000);
        assert_eq!(expired, vec![addr("10.0.0.1/0")]);
        assert!(table.remove(&expired[0], true).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_gc_prunes_external_sources() {
        let mut table = SourceTable::new();
        let (src, _) = table.get_or_create(&addr("10.0.0.1/5000"), None, 0, true);
        src.external(addr("10.0.0.8/5000"), 0);
        src.external(addr("10.0.0.9/5000"), 25_000);
        src.lastevent = 25_000;

        table.garbage_collect(31_000, 30_000);
        let src = table.get(&addr("10.0.0.1/0")).unwrap();
        assert_eq!(src.external_sources.len(), 1);
        assert!(src
            .external_sources
            .contains_key(&addr("10.0.0.9/5000")));
    }

    #[test]
    fn test_gc_invalidates_stale_stats() {
        let mut table = SourceTable::new();
        let (src, _) = table.get_or_create(&addr("10.0.0.1/5000"), None, 0, true);
        src.asm.s.valid = true;
        src.asm.s.lastupdate = 0;
        src.lastevent = 25_000;

        table.garbage_collect(31_000, 30_000);
        let src = table.get(&addr("10.0.0.1/0")).unwrap();
        assert!(!src.asm.s.valid);
    }

    #[test]
    fn test_rx_local_window() {
        let mut table = SourceTable::new();
        let (src, _) = table.get_or_create(&addr("10.0.0.1/5000"), None, 1000, true);
        assert!(src.rx_local(20_000, 30_000));
        assert!(!src.rx_local(40_000, 30_000));

        // Known only through reports: never locally heard.
        let mut table = SourceTable::new();
        let (src, _) = table.get_or_create(&addr("10.0.0.2/5000"), None, 1000, false);
        assert!(!src.rx_local(1000, 30_000));
    }
}
