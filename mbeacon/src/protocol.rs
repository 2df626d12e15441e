//! The beacon wire protocol: probe and report encoding, defensive decoding.
//!
//! Probes are fixed 12-byte packets carrying a sequence number and sender
//! timestamp. Reports are TLV sequences carrying identity and aggregated
//! statistics, including nested per-source blocks. Decoding stops silently
//! at the first structural inconsistency; updates already applied from
//! earlier TLVs in the same packet are kept.

use byteorder::{BigEndian, ByteOrder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::addr::Address;
use crate::config::BeaconConfig;
use crate::source::{BeaconSource, SourceTable};
use crate::ssm::SsmGroupManager;
use crate::stats::Stats;
use crate::transport::Transport;
use crate::wire::{ByteCursor, ByteWriter, WireError};

pub const MAGIC: u16 = 0xBEAC;
pub const PROTO_VERSION: u8 = 1;
pub const TYPE_PROBE: u8 = 0;
pub const TYPE_REPORT: u8 = 1;

/// Probes are exactly this long; anything else is discarded.
pub const PROBE_LEN: usize = 12;
/// Report buffer ceiling. Generous: overflow is a defensive abort, not a
/// normal path.
pub const REPORT_BUF: usize = 8192;

const STATS_BLOCK_LEN: usize = 20;

/// Wire TLV tags.
pub mod tag {
    pub const BEACON_NAME: u8 = b'n';
    pub const ADMIN_CONTACT: u8 = b'a';
    pub const SOURCE_INFO_V4: u8 = b'i';
    pub const SOURCE_INFO_V6: u8 = b'I';
    pub const ASM_STATS: u8 = b'A';
    pub const SSM_STATS: u8 = b'S';
    pub const SOURCE_FLAGS: u8 = b'F';
    pub const WEBSITE_GENERIC: u8 = b'G';
    pub const WEBSITE_MATRIX: u8 = b'M';
    pub const WEBSITE_LG: u8 = b'L';
    pub const COUNTRY: u8 = b'C';
    pub const LEAVE: u8 = b'Q';
}

/// Capability flag bits.
pub mod flag {
    pub const SSM_CAPABLE: u32 = 1;
    pub const SSMPING_CAPABLE: u32 = 2;
}

/// The report variants a beacon emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Identity plus per-source quality statistics.
    Stats,
    /// Identity plus per-source name/contact mapping.
    Map,
    /// Identity plus websites, country code and capability flags.
    Website,
    /// Identity plus a leave marker; sent once at shutdown.
    Leave,
}

/// What a received datagram turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Probe,
    Report,
    /// Bad magic, version, type or length; nothing was updated.
    Ignored,
}

/// Encodes one probe packet.
pub fn build_probe(seq: u32, timestamp: u64) -> Result<Vec<u8>, WireError> {
    let mut w = ByteWriter::new(PROBE_LEN);
    w.write_u16_be(MAGIC)?;
    w.write_u8(PROTO_VERSION)?;
    w.write_u8(TYPE_PROBE)?;
    w.write_u32_be(seq)?;
    w.write_u32_be(timestamp as u32)?;
    Ok(w.into_vec())
}

/// Encodes one report packet.
///
/// Identity TLVs are unconditional. With `publish_sources`, stats and map
/// reports append one source-info block per qualifying source: identified,
/// and for stats reports with at least one valid mode. Identity overflow
/// aborts the whole report; a source block that no longer fits is rolled
/// back and the report is sent with what fit.
pub fn build_report(
    cfg: &BeaconConfig,
    table: &SourceTable,
    kind: ReportKind,
    publish_sources: bool,
    now: u64,
) -> Result<Vec<u8>, WireError> {
    let mut w = ByteWriter::new(REPORT_BUF);
    w.write_u16_be(MAGIC)?;
    w.write_u8(PROTO_VERSION)?;
    w.write_u8(TYPE_REPORT)?;
    w.write_u8(cfg.ttl)?;

    w.write_tlv(tag::BEACON_NAME, cfg.name.as_bytes())?;
    w.write_tlv(tag::ADMIN_CONTACT, cfg.admin_contact.as_bytes())?;

    match kind {
        ReportKind::Website => {
            for (t, url) in &cfg.websites {
                w.write_tlv(*t, url.as_bytes())?;
            }
            if !cfg.country.is_empty() {
                w.write_tlv(tag::COUNTRY, cfg.country.as_bytes())?;
            }
            w.write_tlv_header(tag::SOURCE_FLAGS, 4)?;
            w.write_u32_be(cfg.capability_flags())?;
            return Ok(w.into_vec());
        }
        ReportKind::Leave => {
            w.write_tlv(tag::LEAVE, &[])?;
            return Ok(w.into_vec());
        }
        ReportKind::Stats | ReportKind::Map => {}
    }

    if publish_sources {
        for (_, src) in table.iter() {
            if !src.identified {
                continue;
            }
            if kind == ReportKind::Stats && !src.asm.s.valid && !src.ssm.s.valid {
                continue;
            }
            let mark = w.len();
            if write_source_info(&mut w, cfg, src, kind, now).is_err() {
                // Out of room: drop the partial block, send what fits.
                w.truncate(mark);
                break;
            }
        }
    }

    Ok(w.into_vec())
}

fn write_source_info(
    w: &mut ByteWriter,
    cfg: &BeaconConfig,
    src: &BeaconSource,
    kind: ReportKind,
    now: u64,
) -> Result<(), WireError> {
    let (t, addr_len) = if src.addr.is_ipv6() {
        (tag::SOURCE_INFO_V6, 18)
    } else {
        (tag::SOURCE_INFO_V4, 6)
    };

    let mut len = addr_len;
    if kind == ReportKind::Map {
        len += 2 + src.name.len() + 2 + src.admin_contact.len();
    } else {
        len += if src.asm.s.valid { 22 } else { 0 };
        len += if src.ssm.s.valid { 22 } else { 0 };
        len += 6; // source flags
    }

    w.write_tlv_header(t, len)?;
    match src.addr.ip() {
        IpAddr::V4(ip) => w.write_bytes(&ip.octets())?,
        IpAddr::V6(ip) => w.write_bytes(&ip.octets())?,
    }
    w.write_u16_be(src.addr.port())?;

    if kind == ReportKind::Map {
        w.write_tlv(tag::BEACON_NAME, src.name.as_bytes())?;
        w.write_tlv(tag::ADMIN_CONTACT, src.admin_contact.as_bytes())?;
    } else {
        let age = (now.saturating_sub(src.creation) / 1000) as u32;
        if src.asm.s.valid {
            write_stats_block(w, tag::ASM_STATS, age, src.sttl, cfg.ttl, &src.asm.s)?;
        }
        if src.ssm.s.valid {
            write_stats_block(w, tag::SSM_STATS, age, src.sttl, cfg.ttl, &src.ssm.s)?;
        }
        w.write_tlv_header(tag::SOURCE_FLAGS, 4)?;
        w.write_u32_be(src.flags)?;
    }

    Ok(())
}

fn write_stats_block(
    w: &mut ByteWriter,
    t: u8,
    age_secs: u32,
    sttl: u8,
    default_ttl: u8,
    s: &Stats,
) -> Result<(), WireError> {
    w.write_tlv_header(t, STATS_BLOCK_LEN)?;
    w.write_u32_be(s.timestamp as u32)?;
    w.write_u32_be(age_secs)?;
    // Hops traveled: announced original hop limit minus the TTL we saw.
    let base = if sttl != 0 { sttl } else { default_ttl };
    w.write_u8(base.wrapping_sub(s.rttl))?;
    w.write_f32_be(s.avgdelay)?;
    w.write_f32_be(s.avgjitter)?;
    w.write_u8((s.avgloss * 255.0) as u8)?;
    w.write_u8(if s.avgdup > 10.0 {
        0xff
    } else {
        (s.avgdup * 25.5).ceil() as u8
    })?;
    w.write_u8((s.avgooo * 255.0) as u8)?;
    Ok(())
}

/// Decodes one received datagram and applies its effects.
///
/// Bad magic, version or framing discards the packet without touching
/// anything. Probe packets feed the sender's per-mode statistics window;
/// report packets walk the TLV sequence, updating the sender's entry and
/// creating/refreshing entries for third-party sources named in source-info
/// blocks. Creation of any entry issues an SSM join when an SSM channel is
/// configured; a leave TLV removes the sender and stops the walk.
#[allow(clippy::too_many_arguments)]
pub fn handle_message<T: Transport>(
    cfg: &BeaconConfig,
    table: &mut SourceTable,
    ssm: &mut SsmGroupManager,
    transport: &mut T,
    from: &Address,
    recv_ts: u64,
    ttl: u8,
    buf: &[u8],
    via_ssm: bool,
) -> Received {
    let mut c = ByteCursor::new(buf);
    let Ok(magic) = c.read_u16_be() else {
        return Received::Ignored;
    };
    if magic != MAGIC {
        return Received::Ignored;
    }
    let Ok(version) = c.read_u8() else {
        return Received::Ignored;
    };
    if version != PROTO_VERSION {
        log::trace!("dropping packet from {} with version {}", from, version);
        return Received::Ignored;
    }
    let Ok(ptype) = c.read_u8() else {
        return Received::Ignored;
    };

    match ptype {
        TYPE_PROBE => {
            if buf.len() != PROBE_LEN {
                return Received::Ignored;
            }
            let (Ok(seq), Ok(ts)) = (c.read_u32_be(), c.read_u32_be()) else {
                return Received::Ignored;
            };
            let (src, created) = table.get_or_create(from, None, recv_ts, true);
            src.update(ttl, seq, ts as u64, recv_ts, via_ssm);
            if created {
                ssm.join_if_active(transport, cfg.ssm_group.as_ref(), from);
            }
            Received::Probe
        }
        TYPE_REPORT => {
            let Ok(sttl) = c.read_u8() else {
                return Received::Ignored;
            };
            let created = {
                let (src, created) = table.get_or_create(from, None, recv_ts, true);
                src.sttl = sttl;
                created
            };
            if created {
                ssm.join_if_active(transport, cfg.ssm_group.as_ref(), from);
            }
            parse_report_tlvs(cfg, table, ssm, transport, from, recv_ts, &mut c);
            Received::Report
        }
        _ => Received::Ignored,
    }
}

fn parse_report_tlvs<T: Transport>(
    cfg: &BeaconConfig,
    table: &mut SourceTable,
    ssm: &mut SsmGroupManager,
    transport: &mut T,
    from: &Address,
    recv_ts: u64,
    c: &mut ByteCursor,
) {
    loop {
        let (t, value) = match c.read_tlv() {
            Ok(Some(tlv)) => tlv,
            Ok(None) => return,
            Err(_) => {
                // Structural inconsistency: keep what earlier TLVs already
                // applied, drop the rest of the packet.
                log::trace!("malformed TLV from {}, dropping rest of report", from);
                return;
            }
        };

        match t {
            tag::BEACON_NAME => {
                if let Some(name) = check_string(value) {
                    if let Some(src) = table.get_mut(from) {
                        src.set_name(&name);
                    }
                }
            }
            tag::ADMIN_CONTACT => {
                if let Some(contact) = check_string(value) {
                    if let Some(src) = table.get_mut(from) {
                        src.admin_contact = contact;
                    }
                }
            }
            tag::SOURCE_INFO_V4 | tag::SOURCE_INFO_V6 => {
                parse_source_info(cfg, table, ssm, transport, from, recv_ts, t, value);
            }
            tag::WEBSITE_GENERIC | tag::WEBSITE_LG | tag::WEBSITE_MATRIX => {
                if let Some(url) = check_string(value) {
                    if let Some(src) = table.get_mut(from) {
                        src.websites.insert(t, url);
                    }
                }
            }
            tag::COUNTRY => {
                if value.len() == 2 {
                    if let Some(src) = table.get_mut(from) {
                        src.country = String::from_utf8_lossy(value).into_owned();
                    }
                }
            }
            tag::SOURCE_FLAGS => {
                if value.len() == 4 {
                    if let Some(src) = table.get_mut(from) {
                        src.flags = BigEndian::read_u32(value);
                    }
                }
            }
            tag::LEAVE => {
                if let Some(removed) = table.remove(from, false) {
                    ssm.leave_if_active(transport, cfg.ssm_group.as_ref(), &removed.addr);
                }
                return;
            }
            _ => {
                // Unknown tags are skipped, not fatal.
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn parse_source_info<T: Transport>(
    cfg: &BeaconConfig,
    table: &mut SourceTable,
    ssm: &mut SsmGroupManager,
    transport: &mut T,
    from: &Address,
    recv_ts: u64,
    t: u8,
    value: &[u8],
) {
    let addr_len = if t == tag::SOURCE_INFO_V6 { 18 } else { 6 };
    if value.len() < addr_len {
        return;
    }

    let mut c = ByteCursor::new(value);
    let addr = if t == tag::SOURCE_INFO_V6 {
        let Ok(bytes) = c.read_bytes(16) else { return };
        let Ok(octets) = <[u8; 16]>::try_from(bytes) else {
            return;
        };
        let Ok(port) = c.read_u16_be() else { return };
        Address::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
    } else {
        let Ok(bytes) = c.read_bytes(4) else { return };
        let Ok(octets) = <[u8; 4]>::try_from(bytes) else {
            return;
        };
        let Ok(port) = c.read_u16_be() else { return };
        Address::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
    };

    // Accumulate the relayed view under the sender's entry. The sender may
    // have been removed by an earlier leave TLV in a hostile packet.
    let Some(src) = table.get_mut(from) else {
        return;
    };
    let ext = src.external(addr, recv_ts);

    let mut n = ByteCursor::new(&value[addr_len..]);
    loop {
        let (nt, nv) = match n.read_tlv() {
            Ok(Some(tlv)) => tlv,
            Ok(None) => break,
            Err(_) => break,
        };
        match nt {
            tag::BEACON_NAME => {
                if let Some(name) = check_string(nv) {
                    ext.identified = !name.is_empty();
                    ext.name = name;
                }
            }
            tag::ADMIN_CONTACT => {
                if let Some(contact) = check_string(nv) {
                    ext.contact = contact;
                }
            }
            tag::ASM_STATS | tag::SSM_STATS => {
                let Some((stats, age)) = read_stats_block(nv) else {
                    // A malformed stats block ends the nested walk.
                    break;
                };
                ext.age = age;
                let target = if nt == tag::ASM_STATS {
                    &mut ext.asm
                } else {
                    &mut ext.ssm
                };
                *target = stats;
                target.lastupdate = recv_ts;
            }
            tag::SOURCE_FLAGS => {
                if nv.len() == 4 {
                    ext.flags = BigEndian::read_u32(nv);
                }
            }
            _ => {}
        }
    }

    let identified = ext.identified;
    let name = ext.name.clone();
    let contact = ext.contact.clone();
    let flags = ext.flags;

    // A third-party source is worth probing too: create our own entry for
    // it, which triggers the local SSM join.
    if !addr.same_host(&cfg.unicast) {
        let (inner, created) = table.get_or_create(
            &addr,
            if identified { Some(&name) } else { None },
            recv_ts,
            false,
        );
        if inner.admin_contact.is_empty() {
            inner.admin_contact = contact;
        }
        if inner.flags == 0 {
            inner.flags = flags;
        }
        if created {
            ssm.join_if_active(transport, cfg.ssm_group.as_ref(), &addr);
        }
    }
}

fn read_stats_block(value: &[u8]) -> Option<(Stats, u32)> {
    if value.len() != STATS_BLOCK_LEN {
        return None;
    }
    let mut c = ByteCursor::new(value);
    let mut s = Stats {
        timestamp: c.read_u32_be().ok()? as u64,
        ..Stats::default()
    };
    let age = c.read_u32_be().ok()?;
    s.rttl = c.read_u8().ok()?;
    s.avgdelay = c.read_f32_be().ok()?;
    s.avgjitter = c.read_f32_be().ok()?;
    s.avgloss = c.read_u8().ok()? as f32 / 255.0;
    let dup = c.read_u8().ok()?;
    // 0xff marks "very large": the reporter saturated the byte.
    s.avgdup = if dup == 0xff {
        1e10
    } else {
        dup as f32 / 25.5
    };
    s.avgooo = c.read_u8().ok()? as f32 / 255.0;
    s.valid = true;
    Some((s, age))
}

/// Accepts a wire string only if every byte is printable ASCII-ish
/// (`1..=127`); anything else is treated as garbage and ignored.
fn check_string(value: &[u8]) -> Option<String> {
    if value.iter().all(|&b| (1..=127).contains(&b)) {
        String::from_utf8(value.to_vec()).ok()
    } else {
        None
    }
}
