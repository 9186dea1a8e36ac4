/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::{Error, Result};

/// A link-layer address as returned by the neighbour table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddr(Vec<u8>);

impl HardwareAddr {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        HardwareAddr(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the address with its byte order reversed. Conntrack labels written by
    /// the dataplane store the next-hop MAC in the opposite order from the wire.
    pub fn reversed(&self) -> Self {
        let mut bytes = self.0.clone();
        bytes.reverse();
        HardwareAddr(bytes)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for HardwareAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s
            .split(':')
            .map(|part| u8::from_str_radix(part, 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::InvalidHardwareAddr(s.to_string()))?;
        if bytes.is_empty() {
            return Err(Error::InvalidHardwareAddr(s.to_string()));
        }
        Ok(HardwareAddr(bytes))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            _ => Err(Error::ParseEntry(format!("unknown protocol {s}"))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of an entry the filter address is compared against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMatch {
    /// Destination of the original direction; the port, if any, is the original
    /// destination port.
    OrigDst,
    /// Source or destination of the reply direction; the port, if any, is the reply
    /// source port.
    ReplyAny,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConntrackEntry {
    pub protocol: Protocol,
    pub orig: FlowTuple,
    pub reply: FlowTuple,
    pub labels: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConntrackFilter {
    pub ip: IpAddr,
    pub port: Option<u16>,
    pub protocol: Protocol,
    pub address_match: AddressMatch,
    /// When set, only entries whose labels match none of these values are selected.
    pub unmatched_labels: Option<Vec<Vec<u8>>>,
}

impl ConntrackFilter {
    pub fn orig_dst(ip: IpAddr, protocol: Protocol) -> Self {
        ConntrackFilter {
            ip,
            port: None,
            protocol,
            address_match: AddressMatch::OrigDst,
            unmatched_labels: None,
        }
    }

    pub fn reply_any(ip: IpAddr, port: u16, protocol: Protocol) -> Self {
        ConntrackFilter {
            ip,
            port: (port > 0).then_some(port),
            protocol,
            address_match: AddressMatch::ReplyAny,
            unmatched_labels: None,
        }
    }

    pub fn with_unmatched_labels(mut self, labels: Vec<Vec<u8>>) -> Self {
        self.unmatched_labels = Some(labels);
        self
    }

    pub fn matches(&self, entry: &ConntrackEntry) -> bool {
        if entry.protocol != self.protocol {
            return false;
        }
        let address_ok = match self.address_match {
            AddressMatch::OrigDst => {
                entry.orig.dst == self.ip && self.port.map_or(true, |p| entry.orig.dport == p)
            }
            AddressMatch::ReplyAny => {
                (entry.reply.src == self.ip || entry.reply.dst == self.ip)
                    && self.port.map_or(true, |p| entry.reply.sport == p)
            }
        };
        if !address_ok {
            return false;
        }
        match &self.unmatched_labels {
            None => true,
            Some(allowed) => {
                let labels = entry.labels.as_deref().unwrap_or(&[]);
                !allowed.iter().any(|value| label_matches(labels, value))
            }
        }
    }
}

/// A label value matches when every bit it sets is also set in the entry label.
/// Values longer than the label never match.
pub fn label_matches(labels: &[u8], value: &[u8]) -> bool {
    if value.is_empty() || value.len() > labels.len() {
        return false;
    }
    value
        .iter()
        .zip(labels.iter())
        .all(|(want, have)| have & want == *want)
}

/// Parses one line of `/proc/net/nf_conntrack`. Returns `Ok(None)` for protocols
/// without ports (icmp and friends).
pub fn parse_proc_entry(line: &str) -> Result<Option<ConntrackEntry>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(Error::ParseEntry(line.to_string()));
    }
    let protocol = match fields[2].parse::<Protocol>() {
        Ok(protocol) => protocol,
        Err(_) => return Ok(None),
    };

    let mut srcs = vec![];
    let mut dsts = vec![];
    let mut sports = vec![];
    let mut dports = vec![];
    let mut labels = None;
    for field in &fields[3..] {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let bad = || Error::ParseEntry(line.to_string());
        match key {
            "src" => srcs.push(value.parse::<IpAddr>().map_err(|_| bad())?),
            "dst" => dsts.push(value.parse::<IpAddr>().map_err(|_| bad())?),
            "sport" => sports.push(value.parse::<u16>().map_err(|_| bad())?),
            "dport" => dports.push(value.parse::<u16>().map_err(|_| bad())?),
            "labels" => labels = Some(parse_hex_labels(value).ok_or_else(bad)?),
            _ => {}
        }
    }
    if srcs.len() < 2 || dsts.len() < 2 || sports.len() < 2 || dports.len() < 2 {
        return Err(Error::ParseEntry(line.to_string()));
    }

    Ok(Some(ConntrackEntry {
        protocol,
        orig: FlowTuple {
            src: srcs[0],
            dst: dsts[0],
            sport: sports[0],
            dport: dports[0],
        },
        reply: FlowTuple {
            src: srcs[1],
            dst: dsts[1],
            sport: sports[1],
            dport: dports[1],
        },
        labels,
    }))
}

fn parse_hex_labels(value: &str) -> Option<Vec<u8>> {
    let hex = value.strip_prefix("0x").unwrap_or(value);
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
