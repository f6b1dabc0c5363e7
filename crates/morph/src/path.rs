//! Path arithmetic shared by replies, proxies and reference decoding.

use crate::error::Result;
use crate::link::Link;
use crate::stack::LinkStack;

/// The path to an apartment: everything except servlet, member and data links.
pub fn endpoint_path_of(path: &LinkStack) -> Result<LinkStack> {
    let mut endpoint = path.clone();
    endpoint.retain(|link| !link.is_inner_hop())?;
    Ok(endpoint)
}

/// The path to a device: only the transport hops remain.
pub fn device_path_of(path: &LinkStack) -> Result<LinkStack> {
    let mut device = path.clone();
    device.retain(|link| {
        !matches!(
            link,
            Link::Service(_) | Link::Apartment(_) | Link::ApartmentProxy(_) | Link::Servlet(_) | Link::Member(_) | Link::Data(_)
        )
    })?;
    Ok(device)
}

/// Removes detours (`A B A` becomes `A`) and repeated hops (`A A` becomes `A`).
///
/// Runs to a fixpoint, so collapsing a collapsed path changes nothing.
pub fn collapse(mut links: Vec<Link>) -> Vec<Link> {
    loop {
        let before = links.len();
        let mut i = links.len().saturating_sub(2);
        while links.len() >= 3 && i > 0 {
            i -= 1;
            if i + 2 < links.len() && links[i] == links[i + 2] {
                links.remove(i + 1);
            }
        }
        let mut i = links.len().saturating_sub(1);
        while i > 0 {
            i -= 1;
            if i + 1 < links.len() && links[i] == links[i + 1] {
                links.remove(i + 1);
            }
        }
        if links.len() == before {
            return links;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::ids::ApartmentId;
    use crate::ids::ServletId;
    use crate::link::LinkData;

    fn hop(n: u8) -> Link {
        Link::internet(SocketAddr::from(([10, 0, 0, n], 4000)))
    }

    #[test]
    fn test_collapse_detour() {
        assert_eq!(collapse(vec![hop(1), hop(2), hop(1)]), vec![hop(1)]);
    }

    #[test]
    fn test_collapse_repeats() {
        assert_eq!(collapse(vec![hop(1), hop(1), hop(2)]), vec![hop(1), hop(2)]);
    }

    #[test]
    fn test_collapse_is_idempotent() {
        let paths = vec![
            vec![hop(1), hop(2), hop(2), hop(1)],
            vec![hop(1), hop(2), hop(1), hop(2), hop(3)],
            vec![hop(3), hop(1), hop(1), hop(1)],
            vec![],
            vec![hop(1)],
        ];
        for path in paths {
            let once = collapse(path);
            assert_eq!(collapse(once.clone()), once);
        }
    }

    #[test]
    fn test_collapse_keeps_distinct_hops() {
        let path = vec![hop(1), hop(2), hop(3)];
        assert_eq!(collapse(path.clone()), path);
    }

    #[test]
    fn test_endpoint_and_device_paths() {
        let path = LinkStack::from_links(vec![
            hop(1),
            Link::Apartment(ApartmentId(4)),
            Link::Servlet(ServletId(2)),
            Link::method("Run"),
            Link::Data(LinkData::new(vec![1])),
        ]);
        let endpoint = endpoint_path_of(&path).unwrap();
        assert_eq!(endpoint.to_links().unwrap(), vec![hop(1), Link::Apartment(ApartmentId(4))]);
        let device = device_path_of(&path).unwrap();
        assert_eq!(device.to_links().unwrap(), vec![hop(1)]);
    }
}
