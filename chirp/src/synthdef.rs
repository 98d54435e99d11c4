/// Extract the first synthdef name from an `SCgf` container. Anything
/// beyond the name is the engine's business.
///
/// Both container versions count definitions with a big-endian i16 at
/// offset 8 and start each definition with a pascal string.
pub fn synthdef_name(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 12 || &bytes[..4] != b"SCgf" {
        return None;
    }

    let count = i16::from_be_bytes([bytes[8], bytes[9]]);
    if count < 1 {
        return None;
    }

    let name_len = *bytes.get(10)? as usize;
    let name = bytes.get(11..11 + name_len)?;

    std::str::from_utf8(name).ok().map(str::to_owned)
}
