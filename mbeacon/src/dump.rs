//! Periodic XML snapshot of the source table.
//!
//! The dump is written to a `.working` sibling and renamed into place so
//! readers never see a half-written file. An optional notification program
//! is launched afterwards with the dump path as its first argument.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Child, Command};

use crate::config::BeaconConfig;
use crate::source::SourceTable;
use crate::stats::Stats;

/// Snapshot-wide values the engine hands over alongside the table.
#[derive(Debug, Clone, Copy)]
pub struct DumpInfo {
    pub now: u64,
    pub start: u64,
    pub beacon_interval_secs: f64,
    pub rx_rate_kbps: f64,
    pub tx_rate_kbps: f64,
}

/// Renders the snapshot and atomically replaces `path`.
pub fn write_dump(
    path: &Path,
    cfg: &BeaconConfig,
    table: &SourceTable,
    info: &DumpInfo,
) -> io::Result<()> {
    let working = path.with_extension("working");
    let mut out = Vec::with_capacity(4096);
    render(&mut out, cfg, table, info)?;
    fs::write(&working, &out)?;
    fs::rename(&working, path)
}

/// Launches the post-dump notification program. The child is returned for
/// the caller to reap.
pub fn launch_notifier(program: &str, dump_path: &Path) -> io::Result<Child> {
    Command::new(program).arg(dump_path).spawn()
}

fn render(
    out: &mut Vec<u8>,
    cfg: &BeaconConfig,
    table: &SourceTable,
    info: &DumpInfo,
) -> io::Result<()> {
    writeln!(
        out,
        "<beacons rxrate=\"{:.2}\" txrate=\"{:.2}\" versioninfo=\"mbeacon {}\">",
        info.rx_rate_kbps,
        info.tx_rate_kbps,
        env!("CARGO_PKG_VERSION")
    )?;

    write!(out, "<group")?;
    if let Some(group) = &cfg.probe_group {
        write!(out, " addr=\"{}\"", group)?;
    }
    if let Some(ssm) = &cfg.ssm_group {
        write!(out, " ssmgroup=\"{}\"", ssm)?;
    }
    writeln!(out, " int=\"{:.2}\">", info.beacon_interval_secs)?;

    // Our own view first: the sources we hear, with locally computed stats.
    if cfg.probe_group.is_some() {
        write!(
            out,
            "\t<beacon name=\"{}\" addr=\"{}\"",
            escape(&cfg.name),
            cfg.unicast
        )?;
        if !cfg.admin_contact.is_empty() {
            write!(out, " contact=\"{}\"", escape(&cfg.admin_contact))?;
        }
        if !cfg.country.is_empty() {
            write!(out, " country=\"{}\"", escape(&cfg.country))?;
        }
        writeln!(
            out,
            " age=\"{}\" lastupdate=\"0\">",
            info.now.saturating_sub(info.start) / 1000
        )?;

        for (tag, url) in &cfg.websites {
            writeln!(
                out,
                "\t\t<website type=\"{}\" url=\"{}\" />",
                website_kind(*tag),
                escape(url)
            )?;
        }

        writeln!(out, "\t\t<sources>")?;
        for (_, src) in table.iter() {
            write!(out, "\t\t\t<source addr=\"{}\"", src.addr)?;
            if src.identified {
                write!(out, " name=\"{}\"", escape(&src.name))?;
                if !src.admin_contact.is_empty() {
                    write!(out, " contact=\"{}\"", escape(&src.admin_contact))?;
                }
            }
            if !src.country.is_empty() {
                write!(out, " country=\"{}\"", escape(&src.country))?;
            }
            writeln!(
                out,
                " age=\"{}\" lastupdate=\"{}\">",
                info.now.saturating_sub(src.creation) / 1000,
                info.now.saturating_sub(src.lastevent) / 1000
            )?;

            for (tag, url) in &src.websites {
                writeln!(
                    out,
                    "\t\t\t\t<website type=\"{}\" url=\"{}\" />",
                    website_kind(*tag),
                    escape(url)
                )?;
            }
            if src.asm.s.valid {
                dump_stats(out, "asm", &src.asm.s, info.now, src.sttl, true)?;
            }
            if src.ssm.s.valid {
                dump_stats(out, "ssm", &src.ssm.s, info.now, src.sttl, true)?;
            }
            writeln!(out, "\t\t\t</source>")?;
        }
        writeln!(out, "\t\t</sources>")?;
        writeln!(out, "\t</beacon>")?;
        writeln!(out)?;
    }

    // Then every peer's view: the sources they report hearing.
    for (_, src) in table.iter() {
        write!(out, "\t<beacon")?;
        if src.identified {
            write!(out, " name=\"{}\"", escape(&src.name))?;
            if !src.admin_contact.is_empty() {
                write!(out, " contact=\"{}\"", escape(&src.admin_contact))?;
            }
        }
        write!(out, " addr=\"{}\"", src.addr)?;
        writeln!(
            out,
            " age=\"{}\" lastupdate=\"{}\">",
            info.now.saturating_sub(src.creation) / 1000,
            info.now.saturating_sub(src.lastevent) / 1000
        )?;
        writeln!(out, "\t\t<sources>")?;
        for (addr, ext) in &src.external_sources {
            write!(out, "\t\t\t<source")?;
            if ext.identified {
                write!(
                    out,
                    " name=\"{}\" contact=\"{}\"",
                    escape(&ext.name),
                    escape(&ext.contact)
                )?;
            }
            writeln!(out, " addr=\"{}\" age=\"{}\">", addr, ext.age)?;
            if ext.asm.valid {
                dump_stats(out, "asm", &ext.asm, info.now, src.sttl, false)?;
            }
            if ext.ssm.valid {
                dump_stats(out, "ssm", &ext.ssm, info.now, src.sttl, false)?;
            }
            writeln!(out, "\t\t\t</source>")?;
        }
        writeln!(out, "\t\t</sources>")?;
        writeln!(out, "\t</beacon>")?;
    }

    writeln!(out, "</group>")?;
    writeln!(out, "</beacons>")?;
    Ok(())
}

fn dump_stats(
    out: &mut Vec<u8>,
    tag: &str,
    s: &Stats,
    now: u64,
    sttl: u8,
    local: bool,
) -> io::Result<()> {
    write!(out, "\t\t\t\t<{}", tag)?;
    if local {
        // Locally measured: we know how many hops the probes traveled.
        if sttl != 0 {
            write!(out, " ttl=\"{}\"", sttl.wrapping_sub(s.rttl))?;
        }
    } else {
        write!(out, " ttl=\"{}\"", s.rttl)?;
    }
    write!(out, " rptage=\"{}\"", now.saturating_sub(s.lastupdate) / 1000)?;
    write!(out, " loss=\"{:.1}\"", s.avgloss * 100.0)?;
    write!(out, " delay=\"{:.3}\"", s.avgdelay.abs())?;
    if s.avgdelay < 0.0 {
        // The sender's clock runs ahead of ours.
        write!(out, " future=\"true\"")?;
    }
    write!(out, " jitter=\"{:.3}\"", s.avgjitter)?;
    write!(out, " ooo=\"{:.3}\"", s.avgooo * 100.0)?;
    writeln!(out, " dup=\"{:.3}\" />", s.avgdup * 100.0)
}

fn website_kind(tag: u8) -> &'static str {
    match tag {
        crate::protocol::tag::WEBSITE_LG => "lg",
        crate::protocol::tag::WEBSITE_MATRIX => "matrix",
        _ => "generic",
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Address;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_dump_contains_sources_and_rolls_over() {
        let dir = std::env::temp_dir().join(format!("mbeacon-dump-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dump.xml");

        let cfg = BeaconConfig {
            name: "dump <test> & co".into(),
            admin_contact: "op@example.net".into(),
            probe_group: Some(addr("224.0.23.10/10000")),
            unicast: addr("10.0.0.100/10000"),
            ..BeaconConfig::default()
        };
        let mut table = SourceTable::new();
        let (src, _) = table.get_or_create(&addr("10.0.0.1/5000"), Some("peer"), 1000, true);
        src.asm.s.valid = true;
        src.asm.s.avgloss = 0.5;
        src.external(addr("10.0.0.2/5000"), 1000).identified = false;

        let info = DumpInfo {
            now: 61_000,
            start: 1000,
            beacon_interval_secs: 5.0,
            rx_rate_kbps: 12.5,
            tx_rate_kbps: 3.25,
        };
        write_dump(&path, &cfg, &table, &info).unwrap();

        let xml = fs::read_to_string(&path).unwrap();
        assert!(xml.contains("name=\"dump &lt;test&gt; &amp; co\""));
        assert!(xml.contains("addr=\"10.0.0.1/5000\""));
        assert!(xml.contains("addr=\"10.0.0.2/5000\""));
        assert!(xml.contains("loss=\"50.0\""));
        // The working file was renamed away.
        assert!(!path.with_extension("working").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a&b<c>\"d\""), "a&amp;b&lt;c&gt;&quot;d&quot;");
        assert_eq!(escape("plain"), "plain");
    }
}
