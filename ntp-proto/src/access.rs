//! Hierarchical allow/deny tables over IPv4/IPv6 prefixes (spec §4.10).
//!
//! Each family gets its own tree, branching `NBITS` bits at a time (a
//! stride of 4 gives a branching factor of 16 per level, matching the
//! historical chrony default). A node's `state` is inherited by its
//! descendants until a more specific node overrides it.

use std::net::IpAddr;

const DEFAULT_STRIDE_BITS: u8 = 4;
const BRANCHING_FACTOR: usize = 1 << DEFAULT_STRIDE_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Deny,
    Allow,
    AsParent,
}

struct Node {
    state: FilterState,
    children: Option<Box<[Option<Node>; BRANCHING_FACTOR]>>,
}

impl Node {
    fn leaf(state: FilterState) -> Self {
        Self {
            state,
            children: None,
        }
    }
}

pub struct AccessFilter {
    root_v4: Node,
    root_v6: Node,
}

impl Default for AccessFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessFilter {
    pub fn new() -> Self {
        Self {
            root_v4: Node::leaf(FilterState::Deny),
            root_v6: Node::leaf(FilterState::Deny),
        }
    }

    /// Sets the state of the subtree rooted at `ip/prefix_bits`. When
    /// `prefix_bits` doesn't land on a stride boundary, the last partial
    /// stride is expanded into a contiguous run of sibling leaves so the
    /// tree never needs a bits-within-node remainder.
    ///
    /// `delete_children` additionally prunes any more-specific entries
    /// beneath the node being set, so a broad rule can supersede earlier
    /// narrower ones.
    pub fn set(&mut self, ip: IpAddr, prefix_bits: u8, new_state: FilterState, delete_children: bool) {
        let bits = address_bits(ip);
        let root = self.root_for(ip);
        set_recursive(root, &bits, prefix_bits, new_state, delete_children);
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let bits = address_bits(ip);
        let root = match ip {
            IpAddr::V4(_) => &self.root_v4,
            IpAddr::V6(_) => &self.root_v6,
        };
        matches!(deepest_state(root, &bits), FilterState::Allow)
    }

    fn root_for(&mut self, ip: IpAddr) -> &mut Node {
        match ip {
            IpAddr::V4(_) => &mut self.root_v4,
            IpAddr::V6(_) => &mut self.root_v6,
        }
    }
}

/// MSB-first bit string of the address, one `bool` per bit.
fn address_bits(ip: IpAddr) -> Vec<bool> {
    let octets: Vec<u8> = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let mut bits = Vec::with_capacity(octets.len() * 8);
    for byte in octets {
        for i in (0..8).rev() {
            bits.push((byte >> i) & 1 == 1);
        }
    }
    bits
}

fn stride_index(bits: &[bool]) -> usize {
    let mut idx = 0usize;
    for &b in bits.iter().take(DEFAULT_STRIDE_BITS as usize) {
        idx = (idx << 1) | (b as usize);
    }
    // pad with zero bits if this is the final, partial stride
    idx <<= DEFAULT_STRIDE_BITS as usize - bits.len().min(DEFAULT_STRIDE_BITS as usize);
    idx
}

fn set_recursive(
    node: &mut Node,
    bits: &[bool],
    prefix_bits_remaining: u8,
    new_state: FilterState,
    delete_children: bool,
) {
    if prefix_bits_remaining == 0 {
        node.state = new_state;
        if delete_children {
            node.children = None;
        }
        return;
    }

    if prefix_bits_remaining < DEFAULT_STRIDE_BITS {
        // partial final stride: overwrite the contiguous run of sibling
        // leaves covered by this shorter prefix.
        let parent_state = node.state;
        let children = node
            .children
            .get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
        let covered = 1usize << (DEFAULT_STRIDE_BITS - prefix_bits_remaining);
        let base = stride_index(&bits[..prefix_bits_remaining as usize]);
        for offset in 0..covered {
            let index = base + offset;
            let child = children[index].get_or_insert_with(|| Node::leaf(parent_state));
            child.state = new_state;
            if delete_children {
                child.children = None;
            }
        }
        return;
    }

    let index = stride_index(&bits[..DEFAULT_STRIDE_BITS as usize]);
    let parent_state = node.state;
    let children = node
        .children
        .get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
    let child = children[index].get_or_insert_with(|| Node::leaf(parent_state));
    set_recursive(
        child,
        &bits[DEFAULT_STRIDE_BITS as usize..],
        prefix_bits_remaining - DEFAULT_STRIDE_BITS,
        new_state,
        delete_children,
    );
}

fn deepest_state(node: &Node, bits: &[bool]) -> FilterState {
    let mut best = node.state;
    let mut current = node;
    let mut remaining = bits;

    while remaining.len() >= DEFAULT_STRIDE_BITS as usize {
        let Some(children) = &current.children else {
            break;
        };
        let index = stride_index(&remaining[..DEFAULT_STRIDE_BITS as usize]);
        let Some(child) = &children[index] else {
            break;
        };
        if !matches!(child.state, FilterState::AsParent) {
            best = child.state;
        }
        current = child;
        remaining = &remaining[DEFAULT_STRIDE_BITS as usize..];
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn default_is_deny() {
        let filter = AccessFilter::new();
        assert!(!filter.is_allowed(v4(1, 2, 3, 4)));
    }

    #[test]
    fn spec_scenario_five() {
        let mut filter = AccessFilter::new();
        filter.set(v4(0, 0, 0, 0), 0, FilterState::Deny, true);
        filter.set(v4(10, 0, 0, 0), 8, FilterState::Allow, true);
        filter.set(v4(10, 1, 2, 0), 24, FilterState::Deny, true);

        assert!(filter.is_allowed(v4(10, 0, 0, 1)));
        assert!(!filter.is_allowed(v4(10, 1, 2, 3)));
        assert!(filter.is_allowed(v4(10, 1, 3, 3)));
        assert!(!filter.is_allowed(v4(11, 0, 0, 1)));
    }

    #[test]
    fn longest_prefix_wins_regardless_of_insertion_order() {
        let mut filter = AccessFilter::new();
        filter.set(v4(192, 168, 0, 0), 16, FilterState::Allow, true);
        filter.set(v4(192, 168, 5, 0), 24, FilterState::Deny, true);
        filter.set(v4(192, 168, 5, 128), 25, FilterState::Allow, true);

        assert!(filter.is_allowed(v4(192, 168, 1, 1)));
        assert!(!filter.is_allowed(v4(192, 168, 5, 1)));
        assert!(filter.is_allowed(v4(192, 168, 5, 200)));
    }

    #[test]
    fn non_stride_aligned_prefix_overwrites_sibling_run() {
        let mut filter = AccessFilter::new();
        filter.set(v4(0, 0, 0, 0), 0, FilterState::Deny, true);
        // /2 prefix: covers a quarter of the address space, not aligned to
        // the 4-bit stride.
        filter.set(v4(64, 0, 0, 0), 2, FilterState::Allow, true);

        assert!(filter.is_allowed(v4(64, 1, 2, 3)));
        assert!(filter.is_allowed(v4(100, 0, 0, 0)));
        assert!(!filter.is_allowed(v4(10, 0, 0, 0)));
        assert!(!filter.is_allowed(v4(200, 0, 0, 0)));
    }

    #[test]
    fn delete_children_prunes_more_specific_rules() {
        let mut filter = AccessFilter::new();
        filter.set(v4(10, 0, 0, 0), 8, FilterState::Allow, true);
        filter.set(v4(10, 1, 0, 0), 16, FilterState::Deny, true);
        assert!(!filter.is_allowed(v4(10, 1, 2, 3)));

        filter.set(v4(10, 0, 0, 0), 8, FilterState::Allow, true);
        assert!(filter.is_allowed(v4(10, 1, 2, 3)));
    }
}
