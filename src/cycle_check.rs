use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Adjacency from a node to the nodes it depends on.
pub type Adjacency = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Finds dependency cycles with a three-colour depth-first traversal.
///
/// Every back-edge into a node that is still on the stack yields one cycle,
/// reported as the stack slice from that node to the top followed by the
/// node again, so each cycle starts and ends at the same key. Traversal
/// restarts from every unvisited node, which lets disjoint cycles all be
/// reported. Iteration order is the adjacency's sorted order.
pub fn find_cycles(adjacency: &Adjacency) -> Vec<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut cycles = Vec::new();

    fn dfs<'a>(
        node: &'a str,
        adjacency: &'a Adjacency,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(node, Mark::InProgress);
        stack.push(node);

        if let Some(targets) = adjacency.get(node) {
            for target in targets {
                match marks.get(target.as_str()) {
                    Some(Mark::InProgress) => {
                        // back-edge
                        if let Some(pos) = stack.iter().position(|n| *n == target.as_str()) {
                            let mut cycle: Vec<String> =
                                stack[pos..].iter().map(|n| n.to_string()).collect();
                            cycle.push(target.clone());
                            cycles.push(cycle);
                        }
                    }
                    Some(Mark::Done) => {}
                    None => dfs(target, adjacency, marks, stack, cycles),
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
    }

    for node in adjacency.keys() {
        if !marks.contains_key(node.as_str()) {
            dfs(node, adjacency, &mut marks, &mut stack, &mut cycles);
        }
    }

    cycles
}

pub fn has_cycle(adjacency: &Adjacency) -> bool {
    !find_cycles(adjacency).is_empty()
}
