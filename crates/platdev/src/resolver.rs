//! Startup ordering from declared relationships.
//!
//! A definition may only be opened after every definition it references, because
//! opening consumes the relationship records the referenced containers produced.

use std::collections::{BTreeSet, HashMap};

use crate::definition::Definition;
use crate::error::{PlatformError, PlatformResult};

/// Pass bound of the fixed-point strategy when none is configured.
pub const DEFAULT_MAX_PASSES: usize = 100;

/// Ordering algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// Layered Kahn's algorithm with exact cycle detection.
    #[default]
    Graph,
    /// Repeated passes appending every definition whose targets are ordered,
    /// giving up after `max_passes`.
    FixedPoint { max_passes: usize },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver {
    strategy: ResolveStrategy,
}

impl Resolver {
    pub fn new(strategy: ResolveStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ResolveStrategy {
        self.strategy
    }

    /// Order definitions so each comes after everything it references.
    ///
    /// Definitions that become eligible together keep their relative input order.
    /// Returns indices into `definitions`.
    pub fn order(&self, definitions: &[Definition]) -> PlatformResult<Vec<usize>> {
        let deps = dependencies(definitions)?;
        match self.strategy {
            ResolveStrategy::Graph => kahn(definitions, &deps),
            ResolveStrategy::FixedPoint { max_passes } => fixed_point(definitions, &deps, max_passes),
        }
    }

    /// Like [`Resolver::order`] but returning the definitions themselves.
    pub fn sort<'a>(&self, definitions: &'a [Definition]) -> PlatformResult<Vec<&'a Definition>> {
        Ok(self
            .order(definitions)?
            .into_iter()
            .map(|i| &definitions[i])
            .collect())
    }
}

/// Deduplicated dependency indices of each definition.
fn dependencies(definitions: &[Definition]) -> PlatformResult<Vec<BTreeSet<usize>>> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(definitions.len());
    for (i, definition) in definitions.iter().enumerate() {
        if index.insert(definition.name(), i).is_some() {
            return Err(PlatformError::Precondition(format!(
                "definition name '{}' is used more than once",
                definition.name()
            )));
        }
    }

    definitions
        .iter()
        .map(|definition| {
            definition
                .relationships()
                .values()
                .map(|target| {
                    index.get(target.service.as_str()).copied().ok_or_else(|| {
                        PlatformError::not_found(
                            "relationship target",
                            format!("{} (referenced by {})", target, definition.name()),
                        )
                    })
                })
                .collect::<PlatformResult<BTreeSet<usize>>>()
        })
        .collect()
}

fn kahn(definitions: &[Definition], deps: &[BTreeSet<usize>]) -> PlatformResult<Vec<usize>> {
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
    let mut remaining: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    for (i, targets) in deps.iter().enumerate() {
        for &target in targets {
            dependents[target].push(i);
        }
    }

    let mut order = Vec::with_capacity(definitions.len());
    let mut layer: Vec<usize> = (0..definitions.len()).filter(|&i| remaining[i] == 0).collect();

    while !layer.is_empty() {
        let mut next = Vec::new();
        for &i in &layer {
            for &dependent in &dependents[i] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        order.append(&mut layer);
        next.sort_unstable();
        layer = next;
    }

    if order.len() == definitions.len() {
        Ok(order)
    } else {
        Err(cycle_error(definitions, |i| remaining[i] > 0))
    }
}

fn fixed_point(
    definitions: &[Definition],
    deps: &[BTreeSet<usize>],
    max_passes: usize,
) -> PlatformResult<Vec<usize>> {
    let mut placed = vec![false; definitions.len()];
    let mut order = Vec::with_capacity(definitions.len());

    for _ in 0..max_passes.max(1) {
        if order.len() == definitions.len() {
            break;
        }
        let eligible: Vec<usize> = (0..definitions.len())
            .filter(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]))
            .collect();
        if eligible.is_empty() {
            break;
        }
        for i in eligible {
            placed[i] = true;
            order.push(i);
        }
    }

    if order.len() == definitions.len() {
        Ok(order)
    } else {
        Err(cycle_error(definitions, |i| !placed[i]))
    }
}

fn cycle_error(definitions: &[Definition], unresolved: impl Fn(usize) -> bool) -> PlatformError {
    PlatformError::CyclicDependency {
        names: (0..definitions.len())
            .filter(|&i| unresolved(i))
            .map(|i| definitions[i].name().to_string())
            .collect(),
    }
}
