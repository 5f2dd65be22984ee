//! Transport selection
//!
//! Picks the single peer interface a target node is reached through.

use crate::common::{AddressFamily, Interface, InterfaceType, Node};
use crate::error::{Error, Result};

/// Rank of an interface for sending, `None` if it cannot be used at all
fn rank(iface: &Interface) -> Option<u8> {
    if !iface.is_up() || iface.addresses.is_empty() {
        return None;
    }
    match iface.kind {
        InterfaceType::WiredLan if iface.has_ip_address() => Some(3),
        InterfaceType::WirelessLan if iface.has_ip_address() => Some(2),
        InterfaceType::ShortRangeRadio if iface.has_family(AddressFamily::Bluetooth) => Some(1),
        _ => None,
    }
}

/// Choose the interface to send to `node` through
///
/// Wired beats wireless beats short-range radio. When the node is an
/// application, its first usable application-local interface wins
/// outright. Ties keep the first interface listed.
pub fn select_interface(node: &Node) -> Result<Interface> {
    let mut best: Option<(u8, &Interface)> = None;

    for iface in &node.interfaces {
        if node.is_application()
            && iface.is_application()
            && iface.is_up()
            && iface.has_ip_address()
        {
            return Ok(iface.clone());
        }
        let Some(r) = rank(iface) else {
            continue;
        };
        if best.map_or(true, |(b, _)| r > b) {
            best = Some((r, iface));
        }
    }

    best.map(|(_, iface)| iface.clone())
        .ok_or_else(|| Error::NoRoute(format!("no usable interface for {}", node)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(id: &str, kind: InterfaceType, addr: &str) -> Interface {
        Interface::new(id, kind).with_address(addr.parse().unwrap())
    }

    #[test]
    fn test_wired_preferred() {
        let node = Node::peer(
            "n",
            vec![
                iface("bt0", InterfaceType::ShortRangeRadio, "bt:00:11:22:33:44:55"),
                iface("wlan0", InterfaceType::WirelessLan, "10.0.0.2"),
                iface("eth0", InterfaceType::WiredLan, "10.0.1.2"),
            ],
        );
        assert_eq!(select_interface(&node).unwrap().id.as_str(), "eth0");
    }

    #[test]
    fn test_down_and_addressless_skipped() {
        let node = Node::peer(
            "n",
            vec![
                iface("eth0", InterfaceType::WiredLan, "10.0.1.2").with_up(false),
                Interface::new("eth1", InterfaceType::WiredLan),
                iface("eth2", InterfaceType::WiredLan, "eth:00:11:22:33:44:55"),
                iface("wlan0", InterfaceType::WirelessLan, "10.0.0.2"),
            ],
        );
        assert_eq!(select_interface(&node).unwrap().id.as_str(), "wlan0");
    }

    #[test]
    fn test_bluetooth_fallback() {
        let node = Node::peer(
            "n",
            vec![iface("bt0", InterfaceType::ShortRangeRadio, "bt:00:11:22:33:44:55")],
        );
        assert_eq!(select_interface(&node).unwrap().id.as_str(), "bt0");
    }

    #[test]
    fn test_application_wins_immediately() {
        let interfaces = vec![
            iface("eth0", InterfaceType::WiredLan, "10.0.1.2"),
            iface("app", InterfaceType::ApplicationLocal, "127.0.0.1:8787"),
        ];
        let app = Node::application("app", interfaces.clone());
        assert_eq!(select_interface(&app).unwrap().id.as_str(), "app");

        // Not an application: the application-local interface has no rank
        let peer = Node::peer("p", interfaces);
        assert_eq!(select_interface(&peer).unwrap().id.as_str(), "eth0");
    }

    #[test]
    fn test_no_route() {
        let node = Node::peer("n", vec![Interface::new("eth0", InterfaceType::WiredLan)]);
        assert!(matches!(select_interface(&node), Err(Error::NoRoute(_))));
        assert!(matches!(
            select_interface(&Node::peer("empty", Vec::new())),
            Err(Error::NoRoute(_))
        ));
    }
}
