/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::net::Ipv4Addr;

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_route::{
    link::{LinkAttribute, LinkMessage},
    neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage, NeighbourState},
    AddressFamily, RouteNetlinkMessage,
};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::{Error, HardwareAddr, Result};

/// Returns the link-layer address of `ip` from the IPv4 neighbour table, like
/// `ip -4 neigh show to <ip>`. Incomplete and failed entries are ignored.
pub fn neighbour_hardware_addr(ip: Ipv4Addr) -> Result<Option<HardwareAddr>> {
    let mut request = NeighbourMessage::default();
    request.header.family = AddressFamily::Inet;

    for message in dump(RouteNetlinkMessage::GetNeighbour(request))? {
        let RouteNetlinkMessage::NewNeighbour(neighbour) = message else {
            continue;
        };
        if matches!(
            neighbour.header.state,
            NeighbourState::Incomplete | NeighbourState::Failed | NeighbourState::None
        ) {
            continue;
        }
        let mut destination = None;
        let mut lladdr = None;
        for attr in neighbour.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => {
                    destination = Some(addr)
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => lladdr = Some(bytes),
                _ => {}
            }
        }
        if destination == Some(ip) {
            if let Some(bytes) = lladdr.filter(|b| !b.is_empty()) {
                return Ok(Some(HardwareAddr::new(bytes)));
            }
        }
    }
    Ok(None)
}

/// Returns the names of all links on the host, like `ip link show`.
pub fn link_names() -> Result<Vec<String>> {
    let mut names = vec![];
    for message in dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))? {
        if let RouteNetlinkMessage::NewLink(link) = message {
            for attr in link.attributes {
                if let LinkAttribute::IfName(name) = attr {
                    names.push(name);
                }
            }
        }
    }
    Ok(names)
}

fn dump(request: RouteNetlinkMessage) -> Result<Vec<RouteNetlinkMessage>> {
    let mut socket = Socket::new(NETLINK_ROUTE)
        .map_err(|e| Error::Netlink(format!("open socket failed: {e}")))?;
    socket
        .bind_auto()
        .map_err(|e| Error::Netlink(format!("bind failed: {e}")))?;
    socket
        .connect(&SocketAddr::new(0, 0))
        .map_err(|e| Error::Netlink(format!("connect failed: {e}")))?;

    let mut nl_hdr = NetlinkHeader::default();
    nl_hdr.flags = NLM_F_REQUEST | NLM_F_DUMP;

    let mut packet = NetlinkMessage::new(nl_hdr, NetlinkPayload::from(request));
    packet.finalize();
    let mut buf = vec![0; packet.header.length as usize];
    if buf.len() != packet.buffer_len() {
        return Err(Error::Netlink("construct packet failed".to_string()));
    }
    packet.serialize(&mut buf[..]);
    socket
        .send(&buf[..], 0)
        .map_err(|e| Error::Netlink(format!("netlink send message failed: {e}")))?;

    let mut messages = vec![];
    let mut receive_buffer = vec![0; 32 * 1024];
    loop {
        let size = socket
            .recv(&mut &mut receive_buffer[..], 0)
            .map_err(|e| Error::Netlink(format!("netlink receive message failed: {e}")))?;
        if size == 0 {
            return Ok(messages);
        }

        let mut offset = 0;
        while offset < size {
            let bytes = &receive_buffer[offset..size];
            let message = <NetlinkMessage<RouteNetlinkMessage>>::deserialize(bytes)
                .map_err(|e| Error::Netlink(format!("decode failed: {e:?}")))?;
            let length = message.header.length as usize;
            match message.payload {
                NetlinkPayload::Done(_) => return Ok(messages),
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(Error::Netlink(format!("{err:?}")));
                }
                NetlinkPayload::InnerMessage(inner) => messages.push(inner),
                _ => {}
            }
            if length == 0 {
                break;
            }
            offset += length;
        }
    }
}
