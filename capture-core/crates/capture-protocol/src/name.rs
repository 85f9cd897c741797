use crate::Name;

/// Pack four characters into a classic object name
pub const fn build_name(c1: u8, c2: u8, c3: u8, c4: u8) -> Name {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | (c4 as u32)
}

/// Pack a string of at most four ASCII characters, space padded
///
/// Returns `None` for an empty string, a string longer than four bytes,
/// or non-ASCII input.
pub fn name_from_str(s: &str) -> Option<Name> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 4 || !s.is_ascii() {
        return None;
    }
    let mut packed = [b' '; 4];
    packed[..bytes.len()].copy_from_slice(bytes);
    Some(build_name(packed[0], packed[1], packed[2], packed[3]))
}

/// Render a packed name, replacing unprintable bytes with '.'
pub fn name_to_string(name: Name) -> String {
    let rendered: String = name
        .to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    rendered.trim_end_matches(' ').to_string()
}
