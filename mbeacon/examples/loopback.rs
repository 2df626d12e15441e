//! Loopback example — wires two beacon engines together through recorded
//! transports, replays one side's probes into the other, and prints the
//! resulting statistics and report exchange.
//!
//! Run with: `cargo run --example loopback`

use mbeacon::prelude::*;
use mbeacon::protocol;

fn config(name: &str, unicast: &str) -> BeaconConfig {
    BeaconConfig {
        name: name.into(),
        admin_contact: format!("{}@example.net", name),
        probe_group: Some("224.0.23.10/10000".parse().unwrap()),
        unicast: unicast.parse().unwrap(),
        ..BeaconConfig::default()
    }
}

fn main() {
    env_logger::init();

    let group: Address = "224.0.23.10/10000".parse().unwrap();
    let sender_addr: Address = "10.0.0.1/10000".parse().unwrap();
    let receiver_addr: Address = "10.0.0.2/10000".parse().unwrap();

    let mut sender = BeaconEngine::new(
        config("sender", "10.0.0.1/10000"),
        RecordingTransport::new(),
        0,
    );
    let mut receiver = BeaconEngine::new(
        config("receiver", "10.0.0.2/10000"),
        RecordingTransport::new(),
        0,
    );

    // Run the sender for a minute of simulated time, replaying everything
    // it multicasts into the receiver.
    let mut now = 0u64;
    while now < 60_000 {
        now += sender.next_timeout_ms(now);
        sender.run_due(now);

        for (payload, to) in sender.transport_mut().take_sent() {
            if to != group {
                continue;
            }
            receiver.on_datagram(
                SocketKind::Probe,
                &Datagram {
                    payload,
                    from: sender_addr,
                    to: group,
                    hop_limit: 120,
                    timestamp: now,
                },
            );
        }
    }

    let src = receiver
        .table()
        .get(&sender_addr)
        .expect("receiver heard the sender");
    println!("receiver tracked the sender up to seq {}", src.asm.lastseq);
    println!(
        "stats valid: {} (loss {:.1}%, dup {:.1}%, ooo {:.1}%)",
        src.asm.s.valid,
        src.asm.s.avgloss * 100.0,
        src.asm.s.avgdup * 100.0,
        src.asm.s.avgooo * 100.0
    );

    // Let the receiver report back and show what the sender learns.
    let report = protocol::build_report(
        receiver.config(),
        receiver.table(),
        ReportKind::Stats,
        true,
        now,
    )
    .expect("report encodes");
    sender.on_datagram(
        SocketKind::Report,
        &Datagram {
            payload: report,
            from: receiver_addr,
            to: sender_addr,
            hop_limit: 64,
            timestamp: now,
        },
    );

    let peer = sender
        .table()
        .get(&receiver_addr)
        .expect("sender learned the receiver");
    println!(
        "sender now knows '{}' <{}> with {} relayed source(s)",
        peer.name,
        peer.admin_contact,
        peer.external_sources.len()
    );
}
