//! Dependency-aware ordering of the working set.
//!
//! Objects carry "needs-drop" edges toward their dependents: an edge A → B
//! means B references A and must be dropped while A changes. The sequencer
//! is a depth-first topological sort whose marks live in an external map
//! keyed by object identity, so the entities themselves stay immutable and
//! the traversal is reentrant.
//!
//! The resulting order places every object after its dependents: the most
//! dependent object comes first. Callers apply it as computed for
//! `safedrop` scripts (a view dropping before the view it selects from) and
//! reversed for view recreation, so base views exist again before the views
//! built on top of them.

use crate::error::Error;
use crate::object::ObjectRef;
use crate::Result;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Temporary,
    Permanent,
}

/// Order `nodes` so that every node follows the dependents listed against
/// it. Returns indexes into `nodes`; raises [`Error::Cycle`] when no linear
/// order exists, naming a participant.
pub fn sort_dependent(nodes: &[(ObjectRef, Vec<ObjectRef>)]) -> Result<Vec<usize>> {
    let index_of: HashMap<&ObjectRef, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (reference, _))| (reference, i))
        .collect();

    let mut marks: HashMap<usize, Mark> = HashMap::new();
    let mut ordered = Vec::with_capacity(nodes.len());

    for start in 0..nodes.len() {
        visit(start, nodes, &index_of, &mut marks, &mut ordered)?;
    }
    Ok(ordered)
}

fn visit(
    node: usize,
    nodes: &[(ObjectRef, Vec<ObjectRef>)],
    index_of: &HashMap<&ObjectRef, usize>,
    marks: &mut HashMap<usize, Mark>,
    ordered: &mut Vec<usize>,
) -> Result<()> {
    match marks.get(&node) {
        Some(Mark::Permanent) => return Ok(()),
        Some(Mark::Temporary) => {
            return Err(Error::Cycle {
                object: nodes[node].0.to_string(),
            });
        }
        None => {}
    }
    marks.insert(node, Mark::Temporary);
    for dependent in &nodes[node].1 {
        // Dependents outside the working set have no scripts to order.
        if let Some(&next) = index_of.get(dependent) {
            visit(next, nodes, index_of, marks, ordered)?;
        }
    }
    marks.insert(node, Mark::Permanent);
    ordered.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    fn view(name: &str) -> ObjectRef {
        ObjectRef::new(ObjectKind::View, "app", name)
    }

    #[test]
    fn dependents_come_before_their_base() {
        // v_mid selects from v_base, v_top from v_mid: dropping must start
        // at v_top.
        let nodes = vec![
            (view("v_base"), vec![view("v_mid")]),
            (view("v_mid"), vec![view("v_top")]),
            (view("v_top"), vec![]),
        ];
        let order = sort_dependent(&nodes).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| nodes[i].0.name.as_str()).collect();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("v_top") < pos("v_mid"));
        assert!(pos("v_mid") < pos("v_base"));
    }

    #[test]
    fn unrelated_nodes_keep_a_stable_order() {
        let nodes = vec![
            (view("v_a"), vec![]),
            (view("v_b"), vec![]),
            (view("v_c"), vec![]),
        ];
        let order = sort_dependent(&nodes).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn edges_to_objects_outside_the_set_are_ignored() {
        let nodes = vec![(view("v_a"), vec![view("v_not_here")])];
        let order = sort_dependent(&nodes).unwrap();
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn three_node_cycle_is_fatal() {
        let nodes = vec![
            (view("v_a"), vec![view("v_b")]),
            (view("v_b"), vec![view("v_c")]),
            (view("v_c"), vec![view("v_a")]),
        ];
        let err = sort_dependent(&nodes).unwrap_err();
        match err {
            Error::Cycle { object } => {
                assert!(
                    ["v_a", "v_b", "v_c"].iter().any(|n| object.contains(n)),
                    "cycle error should name a participant, got: {object}"
                );
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }
}
