//! Routing table with longest-prefix match.

use std::net::Ipv4Addr;

use tracing::info;

use crate::network::addr::Subnet;

/// Index of an interface registered with the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub subnet: Subnet,
    /// Next-hop router; `None` means the subnet is on-link.
    pub gateway: Option<Ipv4Addr>,
    pub interface: InterfaceId,
}

impl Route {
    pub fn on_link(subnet: Subnet, interface: InterfaceId) -> Self {
        Route {
            subnet,
            gateway: None,
            interface,
        }
    }

    pub fn via(subnet: Subnet, gateway: Ipv4Addr, interface: InterfaceId) -> Self {
        Route {
            subnet,
            gateway: Some(gateway),
            interface,
        }
    }
}

/// Outcome of a routing lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    /// Address to resolve at the link layer.
    pub addr: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub interface: InterfaceId,
}

/// Static subnets every stack carries, all on-link.
pub const STATIC_SUBNETS: [Subnet; 4] = [
    Subnet::new(Ipv4Addr::UNSPECIFIED, 32),
    Subnet::new(Ipv4Addr::new(169, 254, 0, 0), 16),
    Subnet::new(Ipv4Addr::BROADCAST, 32),
    Subnet::new(Ipv4Addr::new(224, 0, 0, 0), 4),
];

/// Routes sorted by descending prefix length; the first containing match wins.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route, replacing any route for the same subnet on the same interface.
    pub fn add(&mut self, route: Route) {
        let subnet = route.subnet.network();
        let route = Route { subnet, ..route };
        self.routes
            .retain(|r| !(r.subnet == subnet && r.interface == route.interface));
        let pos = self
            .routes
            .iter()
            .position(|r| r.subnet.prefix_len < subnet.prefix_len)
            .unwrap_or(self.routes.len());
        self.routes.insert(pos, route);
        info!(subnet = %subnet, gateway = ?route.gateway, interface = route.interface.0, "route added");
    }

    /// Remove routes for `subnet`, optionally restricted to one interface.
    pub fn remove(&mut self, subnet: Subnet, interface: Option<InterfaceId>) -> usize {
        let subnet = subnet.network();
        let before = self.routes.len();
        self.routes.retain(|r| {
            !(r.subnet == subnet && interface.map_or(true, |iface| r.interface == iface))
        });
        let removed = before - self.routes.len();
        if removed > 0 {
            info!(subnet = %subnet, removed, "route removed");
        }
        removed
    }

    pub fn lookup(&self, dst: Ipv4Addr) -> Option<NextHop> {
        let route = self.routes.iter().find(|r| r.subnet.contains(dst))?;
        Some(NextHop {
            addr: route.gateway.unwrap_or(dst),
            gateway: route.gateway,
            interface: route.interface,
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
