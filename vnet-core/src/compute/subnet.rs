use super::{ComputeHandle, Interface, RemoteError};
use std::net::Ipv4Addr;

/// An IPv4 network given by an address and a netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Network {
    address: u32,
    mask: u32,
}

impl Ipv4Network {
    /// The network an interface sits on, if it has a usable address.
    fn of(interface: &Interface) -> Option<Self> {
        let address: Ipv4Addr = interface.ip_address.parse().ok()?;
        let mask: Ipv4Addr = interface.netmask.as_deref()?.parse().ok()?;
        if address.is_link_local() {
            // 169.254/16 is never routable between hosts
            return None;
        }
        Some(Self {
            address: address.into(),
            mask: mask.into(),
        })
    }

    fn overlaps(&self, other: &Self) -> bool {
        let mask = self.mask & other.mask;
        self.address & mask == other.address & mask
    }
}

fn is_wildcard(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::" | "")
}

/// Finds a pair of addresses, one on `this` and one on `other`, that sit on
/// the same IPv4 network.
///
/// Two handles to the same compute, or to two computes advertising the same
/// concrete host, trivially reach each other through that host. Otherwise the
/// interfaces of both hosts are compared, trying the address `this` advertises
/// first.
pub async fn ip_on_same_subnet<C: ComputeHandle + ?Sized>(
    this: &C,
    other: &dyn ComputeHandle,
) -> Result<(String, String), RemoteError> {
    if this.id() == other.id() || (!is_wildcard(this.host()) && this.host() == other.host()) {
        return Ok((this.host().to_string(), this.host().to_string()));
    }

    let mut ours = this.interfaces().await?;
    let theirs = other.interfaces().await?;
    ours.sort_by_key(|interface| interface.ip_address != this.host());

    for mine in &ours {
        let Some(my_network) = Ipv4Network::of(mine) else {
            continue;
        };
        for peer in &theirs {
            let Some(peer_network) = Ipv4Network::of(peer) else {
                continue;
            };
            if my_network.overlaps(&peer_network) {
                return Ok((mine.ip_address.clone(), peer.ip_address.clone()));
            }
        }
    }

    Err(RemoteError::NoCommonSubnet(
        this.id().to_string(),
        other.id().to_string(),
    ))
}
