// src/delta/mod.rs

//! Delta upgrades
//!
//! A repository may ship binary deltas between successive package files.
//! Each delta turns one package file (`from`) into another (`to`); chaining
//! them forms a graph keyed by file name. Before downloading an upgrade the
//! engine looks for the cheapest chain from a package file already in the
//! cache to the wanted one and only uses it when it is clearly smaller than
//! the full package (see [`MAX_DELTA_RATIO`]).
//!
//! Deltas only reduce download size; the patched result is verified against
//! the package checksum like any other download.

mod patcher;

pub use patcher::{DeltaPatcher, ZstdPatcher};

use std::fmt;
use std::sync::LazyLock;
use regex::Regex;
use tracing::debug;

/// Delta chains must be smaller than this fraction of the full package
pub const MAX_DELTA_RATIO: f64 = 0.7;

static DELTA_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\S+ [[:xdigit:]]{32} [[:digit:]]* \S+ \S+$").ok()
});

/// A binary patch from one package file to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// File name of the delta itself
    pub filename: String,
    pub md5sum: String,
    pub size: u64,
    /// Package file the delta applies to
    pub from: String,
    /// Package file the delta produces
    pub to: String,
    /// Bytes still to fetch; zero once a verified copy is cached
    pub download_size: u64,
}

impl Delta {
    /// Parse a `%DELTAS%` line: `$deltafile $md5 $size $from $to`
    ///
    /// Returns `None` for malformed lines, which are skipped by callers.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !DELTA_LINE.as_ref().is_some_and(|re| re.is_match(line)) {
            return None;
        }

        let mut fields = line.split(' ');
        let filename = fields.next()?.to_string();
        let md5sum = fields.next()?.to_string();
        let size = fields.next()?.parse().unwrap_or(0);
        let from = fields.next()?.to_string();
        let to = fields.next()?.to_string();
        debug!("delta : {} {} '{}'", from, to, size);

        Some(Self {
            filename,
            md5sum,
            size,
            from,
            to,
            download_size: size,
        })
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.filename, self.md5sum, self.size, self.from, self.to
        )
    }
}

/// What the path finder needs to know about locally available files
pub trait DeltaCache {
    /// Is a file with this name in the package cache?
    fn contains(&self, filename: &str) -> bool;

    /// Is this file cached with the expected md5sum?
    fn contains_verified(&self, filename: &str, md5sum: &str) -> bool;
}

/// Cheapest delta chain found for a target file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPath {
    /// Total bytes to download along the chain
    pub size: u64,
    /// Deltas in application order
    pub deltas: Vec<Delta>,
}

struct Vertex {
    delta: Delta,
    /// `None` is infinite distance
    weight: Option<u64>,
    parent: Option<usize>,
    children: Vec<usize>,
    visited: bool,
}

fn build_graph(deltas: &[Delta], cache: &dyn DeltaCache) -> Vec<Vertex> {
    let mut vertices: Vec<Vertex> = deltas
        .iter()
        .map(|d| {
            let mut delta = d.clone();
            delta.download_size = if cache.contains_verified(&delta.filename, &delta.md5sum) {
                0
            } else {
                delta.size
            };
            let weight = cache.contains(&delta.from).then_some(delta.download_size);
            Vertex {
                delta,
                weight,
                parent: None,
                children: Vec::new(),
                visited: false,
            }
        })
        .collect();

    // j is a child of i when j starts where i ends
    for i in 0..vertices.len() {
        let children: Vec<usize> = (0..vertices.len())
            .filter(|&j| vertices[j].delta.from == vertices[i].delta.to)
            .collect();
        vertices[i].children = children;
    }

    vertices
}

/// Find the cheapest chain of deltas ending in the file `to`
///
/// Chains must start from a file already in the cache. Runs Dijkstra over
/// the delta graph with each vertex weighted by its download size; ties
/// keep the first minimum found. Returns `None` when no chain reaches `to`.
pub fn shortest_path(deltas: &[Delta], to: &str, cache: &dyn DeltaCache) -> Option<DeltaPath> {
    if deltas.is_empty() {
        return None;
    }

    debug!("started delta shortest-path search for '{}'", to);
    let mut vertices = build_graph(deltas, cache);

    loop {
        let mut next: Option<usize> = None;
        for (idx, v) in vertices.iter().enumerate() {
            if v.visited || v.weight.is_none() {
                continue;
            }
            if next.is_none_or(|n| v.weight < vertices[n].weight) {
                next = Some(idx);
            }
        }
        let Some(current) = next else { break };
        vertices[current].visited = true;

        let Some(base) = vertices[current].weight else { break };
        for child in vertices[current].children.clone() {
            let candidate = base.saturating_add(vertices[child].delta.download_size);
            if vertices[child].weight.is_none_or(|w| w > candidate) {
                vertices[child].weight = Some(candidate);
                vertices[child].parent = Some(current);
            }
        }
    }

    let mut best: Option<usize> = None;
    for (idx, v) in vertices.iter().enumerate() {
        if v.delta.to != to || v.weight.is_none() {
            continue;
        }
        if best.is_none_or(|b| v.weight < vertices[b].weight) {
            best = Some(idx);
        }
    }

    let best = best?;
    let size = vertices[best].weight?;

    let mut path = Vec::new();
    let mut cursor = Some(best);
    while let Some(idx) = cursor {
        path.push(vertices[idx].delta.clone());
        cursor = vertices[idx].parent;
    }
    path.reverse();

    debug!("delta shortest-path search complete : '{}'", size);
    Some(DeltaPath { size, deltas: path })
}

/// Is a delta chain of `delta_size` worth it for a package of `package_size`?
pub fn worth_using(delta_size: u64, package_size: u64) -> bool {
    (delta_size as f64) < (package_size as f64) * MAX_DELTA_RATIO
}
