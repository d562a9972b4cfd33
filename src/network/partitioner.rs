//! Splitting an element tree into subnetworks of similar size.
//!
//! The split is top-down and greedy:
//!
//! - a budget of 1 wraps the current subtree in one [`BoundaryProxy`]
//! - a leaf (or an empty composite) refuses to split and gives back all but
//!   one unit of its budget
//! - a composite with more children than budget groups its children
//!   contiguously, front-loading the remainder
//! - otherwise the budget is spread over the children, recomputing the share
//!   from what is left at every step

use log::{debug, warn};

use super::{BoundaryProxy, CompositeKind, Twoport};
use crate::error::{Result, TwoportError};

/// A tree with its subnetworks replaced by proxies.
#[derive(Debug)]
pub struct PartitionedNetwork {
    pub root: Twoport,
    /// Proxies in registration order; worker `i` evaluates `proxies[i]`.
    pub proxies: Vec<BoundaryProxy>,
    /// Split budget actually consumed; a leaf that refused to split counts as one.
    pub consumed: usize,
}

impl PartitionedNetwork {
    /// Leaf element count per subnetwork.
    pub fn workload(&self) -> Vec<usize> {
        self.proxies.iter().map(BoundaryProxy::element_count).collect()
    }
}

/// Rewrites element trees, inserting boundary proxies.
#[derive(Debug, Default)]
pub struct NetworkPartitioner {
    proxies: Vec<BoundaryProxy>,
}

impl NetworkPartitioner {
    /// Split `root` into (at most) `split_count` subnetworks.
    ///
    /// The partitioner takes ownership of `root`. With a split count of 1, or
    /// when no branch could be split at all, the whole tree becomes one proxy
    /// under a synthetic serial connector.
    pub fn partition(root: Twoport, split_count: usize) -> Result<PartitionedNetwork> {
        if split_count == 0 {
            return Err(TwoportError::InvalidSplitCount { requested: 0 });
        }

        let mut partitioner = Self::default();
        let (mut root, mut consumed) = if split_count == 1 {
            (Twoport::serial(vec![partitioner.wrap(root)]), 1)
        } else {
            let mut consumed = split_count;
            let root = partitioner.split(root, &mut consumed);
            (root, consumed)
        };
        if partitioner.proxies.is_empty() {
            root = Twoport::serial(vec![partitioner.wrap(root)]);
            consumed = 1;
        }

        if partitioner.proxies.len() < split_count {
            warn!(
                "Requested {} subnetworks but only {} could be formed",
                split_count,
                partitioner.proxies.len()
            );
        }
        debug!("Partitioned network into {} subnetworks", partitioner.proxies.len());

        Ok(PartitionedNetwork {
            root,
            proxies: partitioner.proxies,
            consumed,
        })
    }

    fn wrap(&mut self, subnetwork: Twoport) -> Twoport {
        let proxy = BoundaryProxy::new(subnetwork);
        self.proxies.push(proxy.clone());
        Twoport::Proxy(proxy)
    }

    /// Split `node` with a budget of `split_count`, leaving the consumed budget in it.
    fn split(&mut self, node: Twoport, split_count: &mut usize) -> Twoport {
        debug_assert!(*split_count > 0);
        if *split_count == 1 {
            return self.wrap(node);
        }

        let (kind, observable, children) = match node.into_composite() {
            Ok(parts) => parts,
            Err(leaf) => {
                *split_count = 1;
                return leaf;
            }
        };

        let child_count = children.len();
        if child_count == 0 {
            *split_count = 1;
            return Twoport::composite(kind, children, observable);
        }

        if *split_count < child_count {
            let groups = self.group_children(kind, observable, children, *split_count);
            return Twoport::composite(kind, groups, observable);
        }

        let mut left = *split_count;
        let mut new_children = Vec::with_capacity(child_count);
        for (index, child) in children.into_iter().enumerate() {
            let remaining = child_count - index;
            let each = left / remaining;
            let rest = left % remaining;
            let mut assigned = each + usize::from(rest > 0);
            new_children.push(self.split(child, &mut assigned));
            left -= assigned;
        }
        *split_count -= left;

        Twoport::composite(kind, new_children, observable)
    }

    /// Wrap `groups` contiguous runs of children, the first `len % groups` one larger.
    fn group_children(
        &mut self,
        kind: CompositeKind,
        observable: bool,
        children: Vec<Twoport>,
        groups: usize,
    ) -> Vec<Twoport> {
        let base = children.len() / groups;
        let extra = children.len() % groups;
        let mut children = children.into_iter();
        (0..groups)
            .map(|group| {
                let size = base + usize::from(group < extra);
                let members: Vec<Twoport> = children.by_ref().take(size).collect();
                self.wrap(Twoport::composite(kind, members, observable))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::StateSystemGroup;

    fn parallel_of_resistors(count: usize) -> Twoport {
        Twoport::parallel((0..count).map(|i| Twoport::resistor(1.0 + i as f64)).collect())
    }

    /// Parallel bank of serial RC strings.
    fn pack(branches: usize, cells: usize) -> Twoport {
        Twoport::parallel(
            (0..branches)
                .map(|_| {
                    Twoport::serial(
                        (0..cells)
                            .map(|_| {
                                Twoport::serial(vec![
                                    Twoport::resistor(0.01),
                                    Twoport::parallel(vec![Twoport::capacitance(1000.0), Twoport::resistor(0.02)]),
                                ])
                            })
                            .collect(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_zero_split_rejected() {
        let result = NetworkPartitioner::partition(parallel_of_resistors(3), 0);
        assert!(matches!(result, Err(TwoportError::InvalidSplitCount { .. })));
    }

    #[test]
    fn test_single_split_wraps_whole_tree() {
        let network = NetworkPartitioner::partition(parallel_of_resistors(4), 1).unwrap();
        assert_eq!(network.proxies.len(), 1);
        assert_eq!(network.consumed, 1);
        assert_eq!(network.root.children().len(), 1);
        assert!(network.root.children()[0].as_proxy().is_some());
        assert_eq!(network.workload(), vec![4]);
    }

    #[test]
    fn test_ten_leaves_into_three_groups() {
        let network = NetworkPartitioner::partition(parallel_of_resistors(10), 3).unwrap();
        assert_eq!(network.root.children().len(), 3);
        assert!(network.root.children().iter().all(|c| c.as_proxy().is_some()));
        assert_eq!(network.workload(), vec![4, 3, 3]);
        assert_eq!(network.consumed, 3);
    }

    #[test]
    fn test_groups_keep_child_order() {
        let network = NetworkPartitioner::partition(parallel_of_resistors(5), 2).unwrap();
        let first = network.proxies[0].with_subnetwork(|s| match &s.children()[0] {
            Twoport::Resistor(r) => r.resistance,
            _ => 0.0,
        });
        let second = network.proxies[1].with_subnetwork(|s| match &s.children()[0] {
            Twoport::Resistor(r) => r.resistance,
            _ => 0.0,
        });
        assert_eq!(first, 1.0);
        assert_eq!(second, 4.0);
    }

    #[test]
    fn test_element_count_preserved() {
        let total = pack(4, 3).element_count();
        for split in 1..=4 {
            let network = NetworkPartitioner::partition(pack(4, 3), split).unwrap();
            assert_eq!(network.workload().iter().sum::<usize>(), total, "split {}", split);
            assert_eq!(network.root.element_count(), total);
            assert_eq!(network.proxies.len(), split);
        }
    }

    #[test]
    fn test_budget_spread_over_children() {
        // 2 branches, 5 units: 3 for the first, 2 for the second
        let network = NetworkPartitioner::partition(pack(2, 6), 5).unwrap();
        assert_eq!(network.proxies.len(), 5);
        assert_eq!(network.workload(), vec![6, 6, 6, 9, 9]);
    }

    #[test]
    fn test_leaf_refuses_to_split() {
        let root = Twoport::serial(vec![Twoport::resistor(1.0), parallel_of_resistors(4)]);
        let network = NetworkPartitioner::partition(root, 4).unwrap();
        // The lone resistor stays outside, its unused units go to the parallel branch
        assert!(network.root.children()[0].as_proxy().is_none());
        assert_eq!(network.consumed, 4);
        assert_eq!(network.proxies.len(), 3);
    }

    #[test]
    fn test_unsplittable_tree_falls_back_to_one_proxy() {
        let root = Twoport::serial(vec![Twoport::resistor(1.0), Twoport::resistor(2.0)]);
        let network = NetworkPartitioner::partition(root, 5).unwrap();
        assert_eq!(network.consumed, 1);
        assert_eq!(network.proxies.len(), 1);
        assert_eq!(network.workload(), vec![2]);
    }

    #[test]
    fn test_leaf_root_gets_one_proxy() {
        let network = NetworkPartitioner::partition(Twoport::capacitance(1.0), 3).unwrap();
        assert_eq!(network.proxies.len(), 1);
        assert_eq!(network.consumed, 1);
    }

    #[test]
    fn test_observable_flag_preserved() {
        let root = parallel_of_resistors(6).observed();
        let network = NetworkPartitioner::partition(root, 2).unwrap();
        assert!(network.root.is_observable());
        assert!(network.proxies[0].with_subnetwork(Twoport::is_observable));
    }

    #[test]
    fn test_proxy_spans_cover_rows_contiguously() {
        for split in 1..=4 {
            let mut network = NetworkPartitioner::partition(pack(4, 2), split).unwrap();
            let mut systems = StateSystemGroup::new();
            network.root.set_system(&mut systems).unwrap();

            let mut dgl_next = 0;
            let mut alg_next = 0;
            for proxy in &network.proxies {
                let info = proxy.system_copy_info();
                assert_eq!(info.dgl.first_row(), dgl_next);
                assert_eq!(info.alg.first_row(), alg_next, "split {}", split);
                // every cell carries a parallel RC, so no subnetwork is without Alg rows
                assert!(!info.alg.is_empty());
                dgl_next = info.dgl.end();
                alg_next = info.alg.end();
            }
            assert_eq!(dgl_next, systems.dgl.equation_count());

            // The rows after the last subnetwork connect the proxies at the root
            let connecting = if split == 1 { 0 } else { network.proxies.len() - 1 };
            assert_eq!(alg_next + connecting, systems.alg.equation_count(), "split {}", split);
        }
    }

    #[test]
    fn test_alg_spans_do_not_overlap() {
        let mut network = NetworkPartitioner::partition(pack(3, 3), 3).unwrap();
        let mut systems = StateSystemGroup::new();
        network.root.set_system(&mut systems).unwrap();

        let spans: Vec<_> = network.proxies.iter().map(|p| p.system_copy_info().alg).collect();
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                assert!((a.first_row()..a.end()).all(|row| !b.contains(row)));
            }
        }
        assert_eq!(spans.iter().map(|s| s.len()).sum::<usize>(), 9);
        assert_eq!(systems.alg.equation_count(), 11);
    }

    #[test]
    fn test_empty_composite_is_not_a_subnetwork() {
        let root = Twoport::serial(vec![Twoport::parallel(Vec::new()), parallel_of_resistors(4)]);
        assert!(!root.children()[0].has_children());

        let network = NetworkPartitioner::partition(root, 3).unwrap();
        assert!(network.root.children()[0].as_proxy().is_none());
        assert_eq!(network.proxies.len(), 2);
        assert_eq!(network.workload(), vec![2, 2]);
        assert_eq!(network.consumed, 3);
    }
}
