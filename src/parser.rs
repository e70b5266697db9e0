use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Shape only, octets are not range checked
    static ref IPV4_SHAPE: Regex = Regex::new(r"[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+").unwrap();
    static ref EMAIL_MARKER: Regex = Regex::new(r"email:\s*(\S+)").unwrap();
}

/// An (address, identity) pair pulled out of one log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub ip: String,
    pub identity: String,
}

/// Extract the first IPv4-shaped address and the token after `email:`.
///
/// Returns `None` unless both are present.
pub fn parse_line(line: &str) -> Option<Sighting> {
    let ip = IPV4_SHAPE.find(line)?.as_str();
    let identity = EMAIL_MARKER.captures(line)?.get(1)?.as_str();

    Some(Sighting {
        ip: ip.to_string(),
        identity: identity.to_string(),
    })
}
