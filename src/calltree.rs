use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::records::{self, CallTreeDefRecord};
use crate::region::{DefinitionMap, RegionId};

/// Stable handle into the call-tree arena. Node ids survive across
/// collection cycles; the per-cycle native ids the runtime reports are
/// mapped through a `CycleMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Typed parameter value. Parsing prefers the narrowest signed type,
/// then unsigned, then keeps the string.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Uint(u64),
    Str(String),
}

impl ParamValue {
    fn parse(raw: &str) -> ParamValue {
        if let Ok(v) = raw.parse::<i64>() {
            ParamValue::Int(v)
        } else if let Ok(v) = raw.parse::<u64>() {
            ParamValue::Uint(v)
        } else {
            ParamValue::Str(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Region,
    Parameter,
}

/// Configuration classes a tuning plugin can report results for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigKind {
    StaticWorst,
    StaticBest,
    RtsBest,
    StaticNormalizedBest,
    StaticNormalizedWorst,
    RtsNormalizedBest,
}

#[derive(Debug, Clone, Default)]
pub struct TuningResult {
    pub objective_value: f64,
    pub parameters: BTreeMap<String, i64>,
    pub objectives: BTreeMap<String, f64>,
    pub extra_info: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct Node {
    /// Agent-global id, unique for the lifetime of the tree.
    pub id: u32,
    /// Native ids from the most recent definition cycle.
    pub native_id: u32,
    pub parent_native_id: u32,
    pub region: Option<RegionId>,
    /// Raw node name as reported; callpath segments join these.
    pub name: String,
    pub kind: NodeKind,
    /// Own parameter plus any propagated from ancestor parameter nodes.
    pub parameters: Vec<Parameter>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub callpath: String,
    pub valid: bool,
    pub tuning_results: HashMap<String, BTreeMap<ConfigKind, TuningResult>>,
    pub default_objective: Option<String>,
}

/// Per-cycle mapping from the runtime's native node ids to arena nodes.
/// Valid only for the collection cycle it was built in.
#[derive(Debug, Default)]
pub struct CycleMap {
    by_native: HashMap<u32, NodeId>,
}

impl CycleMap {
    fn register(&mut self, native_id: u32, node: NodeId) {
        self.by_native.insert(native_id, node);
    }

    pub fn resolve(&self, native_id: u32) -> Option<NodeId> {
        self.by_native.get(&native_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_native.is_empty()
    }
}

static PARAM_EXCLUDE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\s+=)|(=\s+)|(={2,})|(=$)").expect("Invalid parameter exclusion regex pattern")
});
static OPERATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"operator\s*((\\)|(!)|(-)|(\+)|(\*)|(/))*=")
        .expect("Invalid operator name regex pattern")
});

/// Decides whether a node name denotes a parameter binding. C++ operator
/// overloads and comparison-looking names contain `=` without being
/// bindings, so those shapes are excluded.
fn extract_parameter(name: &str) -> Option<Parameter> {
    if !name.contains('=') || PARAM_EXCLUDE_RE.is_match(name) || OPERATOR_RE.is_match(name) {
        return None;
    }
    let (param_name, raw_value) = name.split_once('=')?;
    Some(Parameter {
        name: param_name.to_string(),
        value: ParamValue::parse(raw_value),
    })
}

/// The call-tree index. Nodes live in an arena and link by index; the
/// tree is grown incrementally from the definition records of each
/// collection cycle, re-using nodes seen in earlier cycles.
#[derive(Debug, Default)]
pub struct CallTree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    next_global_id: u32,
}

impl CallTree {
    pub fn new() -> Self {
        CallTree::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn alloc(
        &mut self,
        record: &CallTreeDefRecord,
        name: String,
        region: Option<RegionId>,
        parent: Option<NodeId>,
    ) -> NodeId {
        self.next_global_id += 1;
        let (kind, parameters) = match extract_parameter(&name) {
            Some(param) => (NodeKind::Parameter, vec![param]),
            None => (NodeKind::Region, Vec::new()),
        };
        // Parameter nodes carry the region of the call they refine.
        let region = match (kind, parent) {
            (NodeKind::Parameter, Some(parent)) => self.node(parent).region,
            _ => region,
        };
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id: self.next_global_id,
            native_id: record.node_id,
            parent_native_id: record.parent_node_id,
            region,
            name,
            kind,
            parameters,
            parent,
            children: Vec::new(),
            callpath: String::new(),
            valid: true,
            tuning_results: HashMap::new(),
            default_objective: None,
        });
        if let Some(parent) = parent {
            self.node_mut(parent).children.push(id);
        }
        id
    }

    fn reassign_native(&mut self, id: NodeId, record: &CallTreeDefRecord) {
        let node = self.node_mut(id);
        node.native_id = record.node_id;
        node.parent_native_id = record.parent_node_id;
    }

    /// Ingests one cycle's definition records. The first record is the
    /// tree root; later records attach below the most recently placed
    /// node, walking up when their parent id does not match. Region ids
    /// resolve through the same rank's definition pass. Returns the
    /// native-id map for this cycle.
    pub fn ingest(
        &mut self,
        defs: &[CallTreeDefRecord],
        defined: &DefinitionMap,
        rank: u64,
    ) -> CycleMap {
        let mut cycle = CycleMap::default();
        let mut records_iter = defs.iter();

        let root = match records_iter.next() {
            Some(first) => {
                let root = match self.root {
                    Some(root) => {
                        self.reassign_native(root, first);
                        root
                    }
                    None => {
                        let name = records::fixed_cstr(&first.name);
                        let region = defined.resolve(first.region_id);
                        let root = self.alloc(first, name, region, None);
                        self.root = Some(root);
                        root
                    }
                };
                cycle.register(first.node_id, root);
                root
            }
            None => return cycle,
        };

        let mut cursor = root;
        for record in records_iter {
            let name = records::fixed_cstr(&record.name);

            // A zero parent id starts a fresh run of records below the
            // root, as produced by additional threads.
            if record.parent_node_id == 0 {
                self.reassign_native(root, record);
                cycle.register(record.node_id, root);
                cursor = root;
                continue;
            }

            loop {
                if record.parent_node_id == self.node(cursor).native_id {
                    let existing = self
                        .node(cursor)
                        .children
                        .iter()
                        .copied()
                        .find(|&child| {
                            let child = self.node(child);
                            child.native_id == record.node_id || child.name == name
                        });
                    let placed = match existing {
                        Some(child) => {
                            self.reassign_native(child, record);
                            child
                        }
                        None => {
                            let region = defined.resolve(record.region_id);
                            if region.is_none() {
                                debug!(
                                    native_region = record.region_id,
                                    rank,
                                    name = %name,
                                    "call-tree record names an unknown region"
                                );
                            }
                            self.alloc(record, name.clone(), region, Some(cursor))
                        }
                    };
                    cycle.register(record.node_id, placed);
                    cursor = placed;
                    break;
                }
                match self.node(cursor).parent {
                    Some(parent) => cursor = parent,
                    None => {
                        debug!(
                            native_id = record.node_id,
                            parent_native_id = record.parent_node_id,
                            rank,
                            name = %name,
                            "dropping call-tree record with unreachable parent"
                        );
                        break;
                    }
                }
            }
        }

        self.assign_paths();
        cycle
    }

    /// Recomputes callpaths, parameter propagation and validity for the
    /// whole tree. Runs after every ingest.
    fn assign_paths(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let (callpath, inherited) = match self.node(id).parent {
                Some(parent) => {
                    let parent_node = self.node(parent);
                    let callpath = format!("{}/{}", parent_node.callpath, self.node(id).name);
                    // Chained parameter nodes accumulate their ancestors'
                    // bindings.
                    let inherited = if self.node(id).kind == NodeKind::Parameter
                        && parent_node.kind == NodeKind::Parameter
                    {
                        parent_node.parameters.clone()
                    } else {
                        Vec::new()
                    };
                    (callpath, inherited)
                }
                None => (format!("/{}", self.node(id).name), Vec::new()),
            };

            let node = self.node_mut(id);
            node.callpath = callpath;
            for param in inherited {
                if !node.parameters.iter().any(|p| p.name == param.name) {
                    node.parameters.insert(node.parameters.len() - 1, param);
                }
            }

            let has_parameter_child = self
                .node(id)
                .children
                .iter()
                .any(|&child| self.node(child).kind == NodeKind::Parameter);
            let node = self.node_mut(id);
            node.valid = node.children.is_empty() || !has_parameter_child;

            stack.extend(self.node(id).children.iter().copied());
        }
    }

    pub fn find_by_callpath(&self, callpath: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.callpath == callpath)
            .map(|i| NodeId(i as u32))
    }

    /// Valid nodes executing the given region, in arena order.
    pub fn observation_contexts(&self, region: RegionId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.valid && node.region == Some(region))
            .map(|(i, _)| NodeId(i as u32))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node))
    }

    /// Chain of nodes from the root down to `id`, inclusive.
    pub fn path_from_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = vec![id];
        let mut cursor = id;
        while let Some(parent) = self.node(cursor).parent {
            chain.push(parent);
            cursor = parent;
        }
        chain.reverse();
        chain
    }

    pub fn attach_tuning_result(
        &mut self,
        id: NodeId,
        plugin: &str,
        kind: ConfigKind,
        result: TuningResult,
    ) {
        self.node_mut(id)
            .tuning_results
            .entry(plugin.to_string())
            .or_default()
            .insert(kind, result);
    }

    pub fn set_default_objective(&mut self, id: NodeId, objective: &str) {
        self.node_mut(id).default_objective = Some(objective.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::write_cstr;

    fn def(region_id: u32, name: &str, node_id: u32, parent_node_id: u32) -> CallTreeDefRecord {
        let mut rec = CallTreeDefRecord {
            region_id,
            node_id,
            parent_node_id,
            ..Default::default()
        };
        write_cstr(&mut rec.name, name);
        rec
    }

    // Native ids 1..=3 as one rank's definition pass would map them.
    fn defined() -> DefinitionMap {
        let mut map = DefinitionMap::default();
        map.register(1, RegionId(0));
        map.register(2, RegionId(1));
        map.register(3, RegionId(2));
        map
    }

    #[test]
    fn parameter_extraction_rejects_operator_names() {
        assert!(extract_parameter("n=4").is_some());
        assert!(extract_parameter("operator=").is_none());
        assert!(extract_parameter("operator +=").is_none());
        assert!(extract_parameter("a == b").is_none());
        assert!(extract_parameter("x =").is_none());
        assert!(extract_parameter("x= 1").is_none());
        assert!(extract_parameter("x=").is_none());
        assert!(extract_parameter("plain").is_none());
    }

    #[test]
    fn parameter_values_parse_narrowest_first() {
        assert_eq!(
            extract_parameter("n=-3").unwrap().value,
            ParamValue::Int(-3)
        );
        assert_eq!(
            extract_parameter("n=18446744073709551615").unwrap().value,
            ParamValue::Uint(u64::MAX)
        );
        assert_eq!(
            extract_parameter("mode=fast").unwrap().value,
            ParamValue::Str("fast".to_string())
        );
    }

    #[test]
    fn ingest_builds_paths_and_reuses_nodes() {
        let regions = defined();
        let mut tree = CallTree::new();
        let cycle = tree.ingest(
            &[
                def(1, "mainloop", 100, 0),
                def(2, "solve", 101, 100),
                def(3, "smooth", 102, 101),
            ],
            &regions,
            0,
        );
        assert_eq!(tree.len(), 3);
        assert_eq!(cycle.len(), 3);

        let root = tree.root().unwrap();
        assert_eq!(tree.node(root).callpath, "/mainloop");
        let leaf = cycle.resolve(102).unwrap();
        assert_eq!(tree.node(leaf).callpath, "/mainloop/solve/smooth");
        assert!(tree.node(leaf).valid);

        // Next cycle reports fresh native ids for the same shape.
        let cycle2 = tree.ingest(
            &[
                def(1, "mainloop", 7, 0),
                def(2, "solve", 8, 7),
                def(3, "smooth", 9, 8),
            ],
            &regions,
            0,
        );
        assert_eq!(tree.len(), 3);
        assert_eq!(cycle2.resolve(9), Some(leaf));
        assert_eq!(tree.node(leaf).native_id, 9);
    }

    #[test]
    fn sibling_records_walk_back_up() {
        let regions = defined();
        let mut tree = CallTree::new();
        let cycle = tree.ingest(
            &[
                def(1, "mainloop", 1, 0),
                def(2, "solve", 2, 1),
                def(3, "smooth", 3, 2),
                def(3, "smooth2", 4, 1),
            ],
            &regions,
            0,
        );
        let sibling = cycle.resolve(4).unwrap();
        assert_eq!(tree.node(sibling).callpath, "/mainloop/smooth2");
        let root = tree.root().unwrap();
        assert_eq!(tree.node(root).children.len(), 2);
    }

    #[test]
    fn parameter_nodes_invalidate_their_parent() {
        let regions = defined();
        let mut tree = CallTree::new();
        let cycle = tree.ingest(
            &[
                def(1, "mainloop", 1, 0),
                def(2, "solve", 2, 1),
                def(2, "n=4", 3, 2),
            ],
            &regions,
            0,
        );
        let solve = cycle.resolve(2).unwrap();
        let param = cycle.resolve(3).unwrap();
        assert!(!tree.node(solve).valid);
        assert!(tree.node(param).valid);
        assert_eq!(tree.node(param).kind, NodeKind::Parameter);
        // Parameter nodes act for the region of the call they refine.
        assert_eq!(tree.node(param).region, tree.node(solve).region);
        assert_eq!(
            tree.observation_contexts(tree.node(solve).region.unwrap()),
            vec![param]
        );
    }

    #[test]
    fn chained_parameters_propagate() {
        let regions = defined();
        let mut tree = CallTree::new();
        let cycle = tree.ingest(
            &[
                def(1, "mainloop", 1, 0),
                def(2, "solve", 2, 1),
                def(2, "n=4", 3, 2),
                def(2, "m=8", 4, 3),
            ],
            &regions,
            0,
        );
        let inner = cycle.resolve(4).unwrap();
        let params = &tree.node(inner).parameters;
        assert_eq!(params.len(), 2);
        assert!(params.iter().any(|p| p.name == "n"));
        assert!(params.iter().any(|p| p.name == "m"));
        assert_eq!(tree.node(inner).callpath, "/mainloop/solve/n=4/m=8");
    }

    #[test]
    fn zero_parent_reanchors_at_the_root() {
        let regions = defined();
        let mut tree = CallTree::new();
        let cycle = tree.ingest(
            &[
                def(1, "mainloop", 1, 0),
                def(2, "solve", 2, 1),
                def(1, "mainloop", 10, 0),
                def(2, "solve", 11, 10),
            ],
            &regions,
            1,
        );
        assert_eq!(tree.len(), 2);
        assert_eq!(cycle.resolve(1), cycle.resolve(10));
        assert_eq!(cycle.resolve(2), cycle.resolve(11));
    }

    #[test]
    fn callpath_lookup_and_tuning_results() {
        let regions = defined();
        let mut tree = CallTree::new();
        tree.ingest(
            &[def(1, "mainloop", 1, 0), def(2, "solve", 2, 1)],
            &regions,
            0,
        );
        let node = tree.find_by_callpath("/mainloop/solve").unwrap();
        tree.attach_tuning_result(
            node,
            "mpiparams",
            ConfigKind::StaticBest,
            TuningResult {
                objective_value: 1.5,
                ..Default::default()
            },
        );
        tree.set_default_objective(node, "energy");
        let stored = &tree.node(node).tuning_results["mpiparams"][&ConfigKind::StaticBest];
        assert_eq!(stored.objective_value, 1.5);
        assert_eq!(tree.node(node).default_objective.as_deref(), Some("energy"));
    }
}
