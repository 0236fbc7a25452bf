//! Deterministic zip writer: stored entries only, entries sorted by name,
//! fixed DOS timestamp. Byte-identical output for identical inputs, which is
//! what makes FinancePackBundle.v1 content-addressable.

/// 1980-01-01 00:00:00 in DOS date/time encoding.
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = 0x0021;

fn crc32(data: &[u8]) -> u32 {
    let mut table = [0u32; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut c = i as u32;
        for _ in 0..8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
        }
        *slot = c;
    }
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc = table[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Build a zip from (name, bytes) entries. Input order does not matter.
pub fn deterministic_zip(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut sorted: Vec<&(String, Vec<u8>)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    let mut central = Vec::new();
    let count = sorted.len() as u16;

    for (name, data) in sorted {
        let offset = out.len() as u32;
        let crc = crc32(data);
        let name_bytes = name.as_bytes();

        // Local file header
        push_u32(&mut out, 0x0403_4B50);
        push_u16(&mut out, 20); // version needed
        push_u16(&mut out, 0); // flags
        push_u16(&mut out, 0); // stored
        push_u16(&mut out, DOS_TIME);
        push_u16(&mut out, DOS_DATE);
        push_u32(&mut out, crc);
        push_u32(&mut out, data.len() as u32);
        push_u32(&mut out, data.len() as u32);
        push_u16(&mut out, name_bytes.len() as u16);
        push_u16(&mut out, 0); // extra len
        out.extend_from_slice(name_bytes);
        out.extend_from_slice(data);

        // Central directory record
        push_u32(&mut central, 0x0201_4B50);
        push_u16(&mut central, 20); // version made by
        push_u16(&mut central, 20); // version needed
        push_u16(&mut central, 0);
        push_u16(&mut central, 0);
        push_u16(&mut central, DOS_TIME);
        push_u16(&mut central, DOS_DATE);
        push_u32(&mut central, crc);
        push_u32(&mut central, data.len() as u32);
        push_u32(&mut central, data.len() as u32);
        push_u16(&mut central, name_bytes.len() as u16);
        push_u16(&mut central, 0); // extra
        push_u16(&mut central, 0); // comment
        push_u16(&mut central, 0); // disk
        push_u16(&mut central, 0); // internal attrs
        push_u32(&mut central, 0); // external attrs
        push_u32(&mut central, offset);
        central.extend_from_slice(name_bytes);
    }

    let central_offset = out.len() as u32;
    let central_size = central.len() as u32;
    out.extend_from_slice(&central);

    // End of central directory
    push_u32(&mut out, 0x0605_4B50);
    push_u16(&mut out, 0);
    push_u16(&mut out, 0);
    push_u16(&mut out, count);
    push_u16(&mut out, count);
    push_u32(&mut out, central_size);
    push_u32(&mut out, central_offset);
    push_u16(&mut out, 0);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_identical_bytes() {
        let entries = vec![
            ("b.json".to_string(), b"{\"b\":1}".to_vec()),
            ("a.json".to_string(), b"{\"a\":1}".to_vec()),
        ];
        assert_eq!(deterministic_zip(&entries), deterministic_zip(&entries));
    }

    #[test]
    fn entry_order_does_not_matter() {
        let a = vec![
            ("a.json".to_string(), b"x".to_vec()),
            ("b.json".to_string(), b"y".to_vec()),
        ];
        let b = vec![
            ("b.json".to_string(), b"y".to_vec()),
            ("a.json".to_string(), b"x".to_vec()),
        ];
        assert_eq!(deterministic_zip(&a), deterministic_zip(&b));
    }

    #[test]
    fn crc32_known_vector() {
        // CRC-32 of "123456789" per the classic check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
