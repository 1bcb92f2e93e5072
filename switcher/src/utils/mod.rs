use std::net::IpAddr;

/// Renders a session ID the way Bitcoin-family upstreams expect it:
/// 8 lowercase hex chars, big-endian.
pub fn u32_to_hex(value: u32) -> String {
    format!("{value:08x}")
}

/// Little-endian byte-order rendering, used by the Decred session ID formats.
pub fn u32_to_hex_le(value: u32) -> String {
    let bytes = value.to_le_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

/// Packs an IPv4 address into the integer form upstreams expect in
/// `mining.subscribe`. Non-IPv4 peers collapse to 0.
pub fn ip_to_long(addr: &IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from(*v4),
        IpAddr::V6(_) => 0,
    }
}

/// Strips control and non-printable characters from a worker name.
pub fn filter_worker_name(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_graphic()).collect()
}

/// Removes a leading Ethereum wallet address (`0x` + 40 hex chars) and the
/// dot that follows it, if present. Ethereum miners often prepend their
/// payout address to the worker name.
pub fn strip_eth_addr_from_full_name(full_name: &str) -> String {
    let bytes = full_name.as_bytes();
    if bytes.len() >= 42
        && (bytes[0] == b'0')
        && (bytes[1] == b'x' || bytes[1] == b'X')
        && bytes[2..42].iter().all(|b| b.is_ascii_hexdigit())
    {
        let rest = &full_name[42..];
        return rest.strip_prefix('.').unwrap_or(rest).to_string();
    }
    full_name.to_string()
}

/// Splits a full worker name into the sub-account part and the miner part.
/// The miner part keeps its leading dot so it can be re-appended verbatim.
pub fn split_worker_name(full_name: &str) -> (&str, &str) {
    match full_name.find('.') {
        Some(pos) => (&full_name[..pos], &full_name[pos..]),
        None => (full_name, ""),
    }
}
