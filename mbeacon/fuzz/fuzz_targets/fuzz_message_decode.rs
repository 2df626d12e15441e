#![no_main]
use libfuzzer_sys::fuzz_target;

use mbeacon::{
    protocol, Address, BeaconConfig, RecordingTransport, SourceTable, SsmGroupManager,
};

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary input must never panic, whatever state it leaves
    // in the table.
    let cfg = BeaconConfig {
        name: "fuzz".into(),
        admin_contact: "fuzz@example.net".into(),
        probe_group: Some("224.0.23.10/10000".parse().unwrap()),
        ssm_group: Some("232.2.3.2/10000".parse().unwrap()),
        unicast: "10.0.0.100/10000".parse().unwrap(),
        ..BeaconConfig::default()
    };
    let mut table = SourceTable::new();
    let mut ssm = SsmGroupManager::new();
    let mut transport = RecordingTransport::new();
    let from: Address = "10.0.0.1/5000".parse().unwrap();

    let _ = protocol::handle_message(
        &cfg,
        &mut table,
        &mut ssm,
        &mut transport,
        &from,
        12345,
        64,
        data,
        data.len() % 2 == 0,
    );
});
