// src/resolver/graph.rs

//! Dependency ordering of transaction targets
//!
//! Each target is a vertex; there is an edge `a -> b` when a dependency of
//! `a` is satisfied by `b`. Sorting emits every package after the packages it
//! depends on. Cycles are broken where they are found and reported with a
//! warning, so the result of a cyclic input is not guaranteed to be a valid
//! order.

use crate::packages::Package;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnStack,
    Done,
}

/// Vertex per package, edges along dependencies
#[derive(Debug)]
pub struct PackageGraph<'a> {
    packages: &'a [Package],
    children: Vec<Vec<usize>>,
}

impl<'a> PackageGraph<'a> {
    pub fn new(packages: &'a [Package]) -> Self {
        let children = packages
            .iter()
            .map(|p| {
                packages
                    .iter()
                    .enumerate()
                    .filter(|(_, other)| p.depends_on(other))
                    .map(|(idx, _)| idx)
                    .collect()
            })
            .collect();
        Self { packages, children }
    }

    /// Indices of the packages `packages[idx]` depends on
    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    /// Depth-first topological order, dependencies first
    ///
    /// With `reverse` the order is flipped, which is the order packages must
    /// be removed in.
    pub fn topo_sort(&self, reverse: bool) -> Vec<Package> {
        let mut state = vec![Visit::New; self.packages.len()];
        let mut order = Vec::with_capacity(self.packages.len());

        for root in 0..self.packages.len() {
            if state[root] != Visit::New {
                continue;
            }

            // (vertex, next child to look at)
            let mut stack = vec![(root, 0usize)];
            state[root] = Visit::OnStack;

            while let Some(top) = stack.last_mut() {
                let (vertex, next) = *top;
                if let Some(&child) = self.children[vertex].get(next) {
                    top.1 += 1;
                    match state[child] {
                        Visit::New => {
                            state[child] = Visit::OnStack;
                            stack.push((child, 0));
                        }
                        Visit::OnStack if child != vertex => {
                            self.warn_cycle(vertex, child, reverse);
                        }
                        _ => {}
                    }
                } else {
                    state[vertex] = Visit::Done;
                    order.push(self.packages[vertex].clone());
                    stack.pop();
                }
            }
        }

        if reverse {
            order.reverse();
        }
        debug!("sorted {} packages by dependencies", order.len());
        order
    }

    fn warn_cycle(&self, vertex: usize, child: usize, reverse: bool) {
        let pkg = &self.packages[vertex].name;
        let dep = &self.packages[child].name;
        warn!("dependency cycle detected:");
        if reverse {
            warn!("{} will be removed after its {} dependency", pkg, dep);
        } else {
            warn!("{} will be installed before its {} dependency", pkg, dep);
        }
    }
}

/// Sort `targets` so dependencies come first (last with `reverse`)
pub fn sort_by_deps(targets: &[Package], reverse: bool) -> Vec<Package> {
    debug!("started sorting dependencies");
    PackageGraph::new(targets).topo_sort(reverse)
}
