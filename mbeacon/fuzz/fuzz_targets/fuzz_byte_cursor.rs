#![no_main]
use libfuzzer_sys::fuzz_target;

use mbeacon::ByteCursor;

fuzz_target!(|data: &[u8]| {
    // Walk the input as a TLV sequence; no access may leave the buffer.
    let mut cursor = ByteCursor::new(data);
    let _ = cursor.read_u16_be();
    let _ = cursor.read_u8();
    let _ = cursor.read_u8();
    while let Ok(Some((_tag, value))) = cursor.read_tlv() {
        let mut nested = ByteCursor::new(value);
        while let Ok(Some(_)) = nested.read_tlv() {}
    }
});
