use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;
use tracing::warn;

use crate::util::buf::{split_nul, try_get_string};

/// Renders known nodes as `ip:port` entries, the format of a server directory response
pub fn format_server_list(entries: impl IntoIterator<Item = (u16, IpAddr)>) -> Vec<String> {
    entries.into_iter()
        .map(|(port, ip)| format!("{}:{}", ip, port))
        .collect()
}

pub fn parse_server_entry(entry: &str) -> anyhow::Result<SocketAddr> {
    let (ip, port) = entry.rsplit_once(':')
        .ok_or_else(|| anyhow!("server entry {:?} has no port", entry))?;
    let ip: IpAddr = ip.parse()?;
    let port: u16 = port.parse()?;
    Ok(SocketAddr::new(ip, port))
}

/// Parses the payload of a server directory response, preserving order. Malformed entries are
///  skipped rather than failing the whole list.
pub fn parse_server_list(payload: &[u8]) -> Vec<SocketAddr> {
    let mut result = Vec::new();
    for raw in split_nul(payload, usize::MAX) {
        if raw.is_empty() {
            continue;
        }
        match try_get_string(raw).and_then(|s| parse_server_entry(&s)) {
            Ok(addr) => result.push(addr),
            Err(e) => warn!("skipping malformed server entry {:?}: {}", String::from_utf8_lossy(raw), e),
        }
    }
    result
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use rstest::rstest;
    use super::*;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    #[rstest]
    #[case::two(b"127.0.0.1:5001\x00127.0.0.1:5002", vec![localhost(5001), localhost(5002)])]
    #[case::reverse_order(b"127.0.0.1:5002\x00127.0.0.1:5001", vec![localhost(5002), localhost(5001)])]
    #[case::empty(b"", vec![])]
    #[case::malformed_skipped(b"127.0.0.1:5001\0garbage\0127.0.0.1:99999\x00127.0.0.1:5003", vec![localhost(5001), localhost(5003)])]
    #[case::ipv6(b"::1:5001", vec![SocketAddr::new("::1".parse().unwrap(), 5001)])]
    fn test_parse_server_list(#[case] payload: &[u8], #[case] expected: Vec<SocketAddr>) {
        assert_eq!(parse_server_list(payload), expected);
    }

    #[test]
    fn test_format_server_list() {
        let formatted = format_server_list([(5001, Ipv4Addr::LOCALHOST.into()), (5002, Ipv4Addr::new(10, 0, 0, 2).into())]);
        assert_eq!(formatted, vec!["127.0.0.1:5001".to_string(), "10.0.0.2:5002".to_string()]);
    }
}
