//! Dependency graph algorithms over arena indices.
//!
//! Graphs are given as `deps[i]` = indices step `i` depends on.

use std::collections::{BTreeSet, VecDeque};

/// Kahn's algorithm. Ties are broken by arena index, so the order is
/// deterministic for a given graph.
///
/// On a cycle, returns the indices forming one cycle.
pub fn topological_sort(deps: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let n = deps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            in_degree[node] += 1;
            dependents[dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        let stuck: Vec<usize> = (0..n).filter(|&i| in_degree[i] > 0).collect();
        Err(find_cycle(deps, &stuck).unwrap_or(stuck))
    }
}

/// Find one concrete cycle among the given candidate nodes (DFS).
fn find_cycle(deps: &[Vec<usize>], candidates: &[usize]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnStack,
        Done,
    }

    fn visit(
        node: usize,
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        stack.push(node);
        for &dep in &deps[node] {
            match marks[dep] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.reverse();
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(dep, deps, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; deps.len()];
    for &start in candidates {
        if marks[start] == Mark::New {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(start, deps, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Every node that transitively depends on `root`, in ascending order.
pub fn transitive_dependents(deps: &[Vec<usize>], root: usize) -> Vec<usize> {
    let n = deps.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            dependents[dep].push(node);
        }
    }

    let mut seen = vec![false; n];
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        for &dependent in &dependents[node] {
            if !seen[dependent] {
                seen[dependent] = true;
                queue.push_back(dependent);
            }
        }
    }
    (0..n).filter(|&i| seen[i]).collect()
}

/// Whether `ancestor` is reachable by following dependencies from `node`.
pub fn depends_on(deps: &[Vec<usize>], node: usize, ancestor: usize) -> bool {
    let mut seen = vec![false; deps.len()];
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        for &dep in &deps[current] {
            if dep == ancestor {
                return true;
            }
            if !seen[dep] {
                seen[dep] = true;
                stack.push(dep);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diamond_order() {
        // 0 -> {1, 2} -> 3
        let deps = vec![vec![], vec![0], vec![0], vec![1, 2]];
        assert_eq!(topological_sort(&deps).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_order_respects_every_edge() {
        let deps = vec![vec![3], vec![], vec![1], vec![2], vec![0, 2]];
        let order = topological_sort(&deps).unwrap();
        let pos = |n: usize| order.iter().position(|&x| x == n).unwrap();
        for (node, node_deps) in deps.iter().enumerate() {
            for &dep in node_deps {
                assert!(pos(dep) < pos(node), "{} must precede {}", dep, node);
            }
        }
    }

    #[test]
    fn test_cycle_reported() {
        // 0 -> 1 -> 2 -> 1
        let deps = vec![vec![], vec![0, 2], vec![1]];
        let cycle = topological_sort(&deps).unwrap_err();
        let mut sorted = cycle.clone();
        sorted.sort();
        assert_eq!(sorted, vec![1, 2]);
    }

    #[test]
    fn test_self_loop() {
        let deps = vec![vec![0]];
        assert_eq!(topological_sort(&deps).unwrap_err(), vec![0]);
    }

    #[test]
    fn test_transitive_dependents() {
        let deps = vec![vec![], vec![0], vec![1], vec![], vec![2, 3]];
        assert_eq!(transitive_dependents(&deps, 0), vec![1, 2, 4]);
        assert_eq!(transitive_dependents(&deps, 3), vec![4]);
        assert!(transitive_dependents(&deps, 4).is_empty());
    }

    #[test]
    fn test_depends_on() {
        let deps = vec![vec![], vec![0], vec![1]];
        assert!(depends_on(&deps, 2, 0));
        assert!(!depends_on(&deps, 0, 2));
    }
}
