use std::cmp;
use std::fmt::Write;

/// Canonical hex display of `data`, 16 bytes per line.
///
/// Each line shows the address (`offset` plus the position in `data`) in hexadecimal, the bytes as
/// two-column hex and the same bytes as ASCII with control characters replaced by dots.
pub(crate) fn hexdump(data: &[u8], offset: usize) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);

    for (i, line) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}:", offset + i * 16);
        for b in line {
            let _ = write!(out, " {b:02x}");
        }
        // Align the ASCII column of a short last line.
        for _ in line.len()..16 {
            out.push_str("   ");
        }

        out.push_str("  ");
        out.extend(line.iter().map(|b| match *b as char {
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '.',
        }));
        out.push('\n');
    }

    out
}

/// Dump a window of `radius` bytes on each side of `offset`, clamped to `data`.
pub(crate) fn dump_around(data: &[u8], offset: usize, radius: usize) -> String {
    let start = offset.saturating_sub(radius).min(data.len());
    let end = cmp::min(offset.saturating_add(radius), data.len());

    hexdump(&data[start..end], start)
}
