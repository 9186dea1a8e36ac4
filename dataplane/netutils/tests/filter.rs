use std::net::IpAddr;

use anyhow::Result;
use netutils::conntrack::parse_proc_entry;
use netutils::{ConntrackEntry, ConntrackFilter, HardwareAddr, Protocol};

fn entry(line: &str) -> Result<ConntrackEntry> {
    parse_proc_entry(line)?.ok_or_else(|| anyhow::anyhow!("entry skipped"))
}

fn gateway_flow(labels: &str) -> String {
    format!(
        "ipv4     2 udp      17 28 src=172.18.0.9 dst=10.244.1.7 sport=5353 dport=5353 \
         src=10.244.1.7 dst=172.18.0.9 sport=5353 dport=5353 mark=0 labels={labels} zone=0 use=2"
    )
}

#[test]
fn test_unmatched_labels_keep_allowed_next_hop() -> Result<()> {
    let mac: HardwareAddr = "0a:58:ac:12:00:09".parse()?;
    let label = mac.reversed();
    let hex: String = label
        .as_bytes()
        .iter()
        .chain([0u8; 10].iter())
        .map(|b| format!("{b:02x}"))
        .collect();
    let flow = entry(&gateway_flow(&format!("0x{hex}")))?;

    let pod_ip: IpAddr = "10.244.1.7".parse()?;
    let allow = ConntrackFilter::orig_dst(pod_ip, Protocol::Udp)
        .with_unmatched_labels(vec![label.clone().into_bytes()]);
    assert!(!allow.matches(&flow), "allowed next hop must survive");

    let other: HardwareAddr = "0a:58:ac:12:00:0a".parse()?;
    let deny = ConntrackFilter::orig_dst(pod_ip, Protocol::Udp)
        .with_unmatched_labels(vec![other.reversed().into_bytes()]);
    assert!(deny.matches(&flow), "unknown next hop must be selected");
    Ok(())
}

#[test]
fn test_sentinel_selects_every_flow() -> Result<()> {
    let flow = entry(&gateway_flow("0xffffffffffffffffffffffffffffffff"))?;
    let filter = ConntrackFilter::orig_dst("10.244.1.7".parse()?, Protocol::Udp)
        .with_unmatched_labels(vec![b"does-not-contain-anything".to_vec()]);
    assert!(filter.matches(&flow));
    Ok(())
}

#[test]
fn test_reply_any_matches_endpoint_port() -> Result<()> {
    let line = "ipv4     2 udp      17 28 src=10.244.0.5 dst=10.96.0.10 sport=40000 dport=53 \
                src=10.244.2.3 dst=10.244.0.5 sport=5353 dport=40000 mark=0 zone=0 use=2";
    let flow = entry(line)?;
    let endpoint: IpAddr = "10.244.2.3".parse()?;
    assert!(ConntrackFilter::reply_any(endpoint, 5353, Protocol::Udp).matches(&flow));
    assert!(!ConntrackFilter::reply_any(endpoint, 53, Protocol::Udp).matches(&flow));
    assert!(!ConntrackFilter::reply_any(endpoint, 5353, Protocol::Tcp).matches(&flow));
    Ok(())
}

#[test]
fn test_reversal_is_an_involution() -> Result<()> {
    let mac: HardwareAddr = "00:11:22:33:44:55".parse()?;
    assert_eq!(mac.reversed().as_bytes(), &[0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
    assert_eq!(mac.reversed().reversed(), mac);
    Ok(())
}
