//! Hex dumps for trace logging of wire structures.

use std::fmt::Write;

/// Formats `bytes` as rows of 16, each prefixed by its offset and followed by the
/// printable ASCII rendering.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}:", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {b:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::hexdump;

    #[test]
    fn dumps_rows_with_ascii() {
        let dump = hexdump(b"USBC\x01\x02");
        assert_eq!(
            dump,
            "0000: 55 53 42 43 01 02                                USBC..\n"
        );
    }

    #[test]
    fn splits_every_sixteen_bytes() {
        let dump = hexdump(&[0u8; 20]);
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.lines().nth(1).unwrap().starts_with("0010: 00 00 00 00"));
    }
}
