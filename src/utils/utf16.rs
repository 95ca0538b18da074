/// Decode a UTF-16LE byte slice up to the first NUL code unit, if present.
///
/// Unpaired surrogates become U+FFFD and an odd trailing byte is ignored; string decoding never
/// fails on damaged input.
pub(crate) fn decode_utf16le_lossy(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .take_while(|&unit| unit != 0);

    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
