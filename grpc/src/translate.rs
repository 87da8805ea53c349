//! Converts the core [`AddressSet`] into `linkerd2_proxy_api::destination`
//! wire messages.

use linkerd_destination_core::{AddressSet, Port};
use linkerd2_proxy_api::{
    destination::{update, AddrSet, Update, WeightedAddr, WeightedAddrSet},
    net::{ip_address, IpAddress, TcpAddress},
};
use std::net::IpAddr;

/// Wraps an `update::Update` oneof variant in the message envelope.
pub(crate) fn to_update(update: update::Update) -> Update {
    Update {
        update: Some(update),
    }
}

pub(crate) fn to_weighted_addr_set(set: &AddressSet, weight: u32) -> WeightedAddrSet {
    let addrs = set
        .addresses()
        .filter_map(|(_, addr)| {
            let tcp_addr = to_tcp_address(&addr.ip, addr.port)?;
            Some(WeightedAddr {
                addr: Some(tcp_addr),
                weight,
                metric_labels: [
                    ("pod_template_hash".to_string(), String::new()),
                    ("owner_kind".to_string(), addr.owner_kind.clone()),
                    ("owner_name".to_string(), addr.owner_name.clone()),
                ]
                .into_iter()
                .filter(|(_, v)| !v.is_empty())
                .collect(),
                tls_identity: None,
                protocol_hint: None,
                authority_override: String::new(),
            })
        })
        .collect();

    WeightedAddrSet {
        addrs,
        metric_labels: set.labels().clone().into_iter().collect(),
    }
}

pub(crate) fn to_addr_set(set: &AddressSet) -> AddrSet {
    let addrs = set
        .addresses()
        .filter_map(|(_, addr)| to_tcp_address(&addr.ip, addr.port))
        .collect();
    AddrSet { addrs }
}

fn to_tcp_address(ip: &str, port: Port) -> Option<TcpAddress> {
    let ip: IpAddr = ip.parse().ok()?;
    let proto_ip = match ip {
        IpAddr::V4(v4) => ip_address::Ip::Ipv4(u32::from_be_bytes(v4.octets())),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let (high, low) = octets.split_at(8);
            ip_address::Ip::Ipv6(ip_address::Ipv6 {
                first: u64::from_be_bytes(high.try_into().unwrap()),
                last: u64::from_be_bytes(low.try_into().unwrap()),
            })
        }
    };
    Some(TcpAddress {
        ip: Some(IpAddress { ip: Some(proto_ip) }),
        port,
    })
}
