use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::path::{Path, PathBuf};

/// Dense module id. The entry module is always `0`.
pub type ModuleId = usize;

/// Identity of a module inside one compilation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleKey {
    File(PathBuf),
    External(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleKind {
    /// A file run through its loader chain
    Source { path: PathBuf, loaders: Vec<String> },
    /// Provided at runtime by a global variable
    External { request: String, global: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub id: ModuleId,
    pub kind: ModuleKind,
    /// Module body after loaders and `require` rewriting
    pub code: String,
}

impl Module {
    pub fn path(&self) -> Option<&Path> {
        match &self.kind {
            ModuleKind::Source { path, .. } => Some(path),
            ModuleKind::External { .. } => None,
        }
    }
}

/// Modules of a compilation and the `require` edges between them.
///
/// Ids are handed out in insertion order and double as graph node indices.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: Vec<Module>,
    ids: IndexMap<ModuleKey, ModuleId>,
    graph: DiGraph<ModuleId, ()>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `key`, adding a module built by `kind` when the key is new.
    /// The boolean is true when the module was added by this call.
    pub fn intern(
        &mut self,
        key: ModuleKey,
        kind: impl FnOnce() -> ModuleKind,
    ) -> (ModuleId, bool) {
        if let Some(&id) = self.ids.get(&key) {
            return (id, false);
        }

        let id = self.modules.len();
        let node = self.graph.add_node(id);
        debug_assert_eq!(node.index(), id);

        let kind = kind();
        let code = match &kind {
            ModuleKind::External { global, .. } => format!("module.exports = {global};"),
            ModuleKind::Source { .. } => String::new(),
        };
        self.modules.push(Module { id, kind, code });
        self.ids.insert(key, id);
        (id, true)
    }

    pub fn set_code(&mut self, id: ModuleId, code: String) {
        self.modules[id].code = code;
    }

    pub fn add_dependency(&mut self, from: ModuleId, to: ModuleId) {
        let (from, to) = (NodeIndex::new(from), NodeIndex::new(to));
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Direct dependencies of `id`, in the order they were first required
    pub fn dependencies(&self, id: ModuleId) -> Vec<ModuleId> {
        // petgraph walks edges newest first
        let mut deps: Vec<ModuleId> = self
            .graph
            .neighbors_directed(NodeIndex::new(id), Direction::Outgoing)
            .map(|node| self.graph[node])
            .collect();
        deps.reverse();
        deps
    }

    /// Every file read while building the graph
    pub fn source_files(&self) -> impl Iterator<Item = &Path> {
        self.modules.iter().filter_map(Module::path)
    }

    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Strongly connected groups of modules that require each other, smallest id first
    pub fn cycles(&self) -> Vec<Vec<ModuleId>> {
        let mut groups: Vec<Vec<ModuleId>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|group| {
                group.len() > 1
                    || group
                        .first()
                        .is_some_and(|&node| self.graph.find_edge(node, node).is_some())
            })
            .map(|group| {
                let mut ids: Vec<ModuleId> =
                    group.into_iter().map(|node| self.graph[node]).collect();
                ids.sort_unstable();
                ids
            })
            .collect();
        groups.sort();
        groups
    }
}
