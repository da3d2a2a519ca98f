//! Recursive flattening of SPF `include:` chains into concrete ranges.
//!
//! Sibling includes are expanded concurrently. Every branch returns its own
//! [`Branch`] and the parent merges them in declaration order. Concurrent
//! branches share only the visited set and the include edges; cycles are
//! found on the finished graph, so a loop between siblings is reported just
//! like a loop back to an ancestor.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::mechanism::{scan_terms, SpfTerm};
use crate::common::dns::DnsResolver;
use crate::common::domain::validate_hostname;
use crate::config::SpfConfig;
use crate::error::{EngineError, Result};
use crate::record::{fetch_txt, RecordKind};

/// Flattened view of an include target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpfResolution {
    /// Deduplicated `ip4:`/`ip6:` values, verbatim, in discovery order.
    pub ip_ranges: Vec<String>,
    /// Every host whose SPF record was fetched, root first.
    pub includes: Vec<String>,
    /// DNS failures, missing records, cycles and limit violations.
    pub errors: Vec<String>,
}

impl SpfResolution {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Default)]
struct Branch {
    ranges: Vec<String>,
    includes: Vec<String>,
    errors: Vec<String>,
}

impl Branch {
    fn merge(&mut self, other: Branch) {
        self.ranges.extend(other.ranges);
        self.includes.extend(other.includes);
        self.errors.extend(other.errors);
    }
}

struct Walk<'a, R> {
    resolver: &'a R,
    max_depth: usize,
    visited: Mutex<HashSet<String>>,
    /// Include edges of every expanded host, in record order.
    edges: Mutex<HashMap<String, Vec<String>>>,
}

impl<'a, R: DnsResolver> Walk<'a, R> {
    fn is_claimed(&self, host: &str) -> bool {
        lock(&self.visited).contains(host)
    }

    /// Mark `host` as taken. Returns false if another branch already has it.
    fn claim(&self, host: &str) -> bool {
        lock(&self.visited).insert(host.to_string())
    }

    fn expand(&self, host: String, depth: usize) -> BoxFuture<'_, Branch> {
        async move {
            let mut branch = Branch {
                includes: vec![host.clone()],
                ..Branch::default()
            };

            let lookup = match fetch_txt(self.resolver, &host, RecordKind::Spf).await {
                Ok(lookup) => lookup,
                Err(e) => {
                    warn!(host = %host, error = %e, "SPF include lookup failed");
                    branch.errors.push(format!("DNS lookup failed for {host}: {e}"));
                    return branch;
                }
            };
            let Some(record) = lookup.matched else {
                branch.errors.push(format!("no SPF record found at {host}"));
                return branch;
            };
            let spf_count = lookup
                .records
                .iter()
                .filter(|r| RecordKind::Spf.matches(r))
                .count();
            if spf_count > 1 {
                branch.errors.push(format!(
                    "{host} publishes {spf_count} SPF records, only the first was used"
                ));
            }

            let mut children = Vec::new();
            for term in scan_terms(&record) {
                match term {
                    SpfTerm::Ip4 { value, .. } | SpfTerm::Ip6 { value, .. } => {
                        branch.ranges.push(value)
                    }
                    SpfTerm::Include { domain, .. } | SpfTerm::Redirect(domain) => {
                        children.push(domain)
                    }
                    SpfTerm::Other(_) => {}
                }
            }

            let mut edges = Vec::new();
            let mut pending = Vec::new();
            for child in children {
                let Some(child) = validate_hostname(&child) else {
                    branch
                        .errors
                        .push(format!("unsupported include target {child:?} in {host}"));
                    continue;
                };
                if !edges.contains(&child) {
                    edges.push(child.clone());
                }
                if self.is_claimed(&child) {
                    // cycle or diamond, told apart once the whole graph is known
                    debug!(host = %host, include = %child, "include already expanded");
                    continue;
                }
                if depth + 1 > self.max_depth {
                    warn!(host = %host, include = %child, depth, "SPF recursion limit exceeded");
                    branch.errors.push(format!(
                        "recursion limit exceeded: {child} (included from {host}) is deeper than {}",
                        self.max_depth
                    ));
                    continue;
                }
                if self.claim(&child) {
                    pending.push(child);
                }
            }
            lock(&self.edges).insert(host.clone(), edges);

            let children = join_all(
                pending
                    .into_iter()
                    .map(|child| self.expand(child, depth + 1)),
            )
            .await;
            for child in children {
                branch.merge(child);
            }
            branch
        }
        .boxed()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Depth-first search of the include graph from `root`. Every edge back to
/// a host still on the search stack closes a cycle.
fn find_cycles(root: &str, edges: &HashMap<String, Vec<String>>) -> Vec<String> {
    fn visit<'g>(
        host: &'g str,
        edges: &'g HashMap<String, Vec<String>>,
        stack: &mut Vec<&'g str>,
        done: &mut HashSet<&'g str>,
        found: &mut Vec<String>,
    ) {
        stack.push(host);
        for child in edges.get(host).into_iter().flatten() {
            if stack.contains(&child.as_str()) {
                found.push(format!("include cycle detected: {host} -> {child}"));
            } else if !done.contains(child.as_str()) {
                visit(child, edges, stack, done, found);
            }
        }
        stack.pop();
        done.insert(host);
    }

    let mut found = Vec::new();
    visit(root, edges, &mut Vec::new(), &mut HashSet::new(), &mut found);
    found
}

/// Resolve `include` into its flattened set of ranges.
///
/// Only an invalid target name is an error. DNS failures, cycles and limit
/// violations end up in [`SpfResolution::errors`] next to whatever ranges the
/// healthy branches produced.
pub async fn resolve_include<R: DnsResolver>(
    resolver: &R,
    include: &str,
    config: &SpfConfig,
) -> Result<SpfResolution> {
    let root =
        validate_hostname(include).ok_or_else(|| EngineError::InvalidDomain(include.to_string()))?;

    let walk = Walk {
        resolver,
        max_depth: config.max_depth,
        visited: Mutex::new(HashSet::from([root.clone()])),
        edges: Mutex::new(HashMap::new()),
    };
    let branch = walk.expand(root.clone(), 0).await;
    let cycles = find_cycles(&root, &lock(&walk.edges));
    for cycle in &cycles {
        warn!(include = %root, "{cycle}");
    }

    let mut seen = HashSet::new();
    let mut ip_ranges: Vec<String> = branch
        .ranges
        .into_iter()
        .filter(|r| seen.insert(r.to_ascii_lowercase()))
        .collect();
    let mut errors = branch.errors;
    errors.extend(cycles);
    if ip_ranges.len() > config.max_ranges {
        let dropped = ip_ranges.len() - config.max_ranges;
        ip_ranges.truncate(config.max_ranges);
        errors.push(format!(
            "range limit of {} reached, {dropped} ranges dropped",
            config.max_ranges
        ));
    }

    debug!(
        include = %root,
        ranges = ip_ranges.len(),
        includes = branch.includes.len(),
        errors = errors.len(),
        "SPF include resolved"
    );
    Ok(SpfResolution {
        ip_ranges,
        includes: branch.includes,
        errors,
    })
}
