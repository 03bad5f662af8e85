//! Prefix-merging stack storage
//!
//! Traces sharing a prefix share nodes: each node is keyed by its parent and
//! its interned symbol, so inserting a trace costs O(depth) and the tree
//! grows with the number of distinct prefixes, not with the number of
//! samples. Nodes live in an arena and refer to each other by [`NodeId`].

use std::collections::HashMap;
use std::sync::Arc;

/// Interned symbol name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default, Clone)]
pub struct Interner {
    ids: HashMap<Arc<str>, SymbolId>,
    names: Vec<Arc<str>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = SymbolId(self.names.len() as u32);
        let name: Arc<str> = Arc::from(name);
        self.names.push(name.clone());
        self.ids.insert(name, id);
        id
    }

    pub fn get(&self, name: &str) -> Option<SymbolId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: SymbolId) -> &str {
        &self.names[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StackNode<A> {
    pub symbol: SymbolId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Caller-defined per-node data, updated by the augment callback
    pub data: A,
}

#[derive(Debug, Clone)]
pub struct StackStash<A> {
    nodes: Vec<StackNode<A>>,
    index: HashMap<(NodeId, SymbolId), NodeId>,
}

impl<A: Default> StackStash<A> {
    pub fn new(root_symbol: SymbolId) -> Self {
        Self {
            nodes: vec![StackNode {
                symbol: root_symbol,
                parent: None,
                children: Vec::new(),
                data: A::default(),
            }],
            index: HashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &StackNode<A> {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut StackNode<A> {
        &mut self.nodes[id.index()]
    }

    pub fn child(&self, parent: NodeId, symbol: SymbolId) -> Option<NodeId> {
        self.index.get(&(parent, symbol)).copied()
    }

    /// Merge `symbols` (outermost first) beneath `from`, returning the leaf.
    ///
    /// `augment` is called once for every node on the path, `from` included,
    /// with `true` for the leaf.
    pub fn merge_trace<F>(&mut self, from: NodeId, symbols: &[SymbolId], mut augment: F) -> NodeId
    where
        F: FnMut(&mut A, bool),
    {
        let mut node = from;
        augment(&mut self.nodes[node.index()].data, symbols.is_empty());

        for (i, &symbol) in symbols.iter().enumerate() {
            node = match self.child(node, symbol) {
                Some(child) => child,
                None => self.insert_child(node, symbol),
            };
            augment(&mut self.nodes[node.index()].data, i + 1 == symbols.len());
        }
        node
    }

    fn insert_child(&mut self, parent: NodeId, symbol: SymbolId) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(StackNode {
            symbol,
            parent: Some(parent),
            children: Vec::new(),
            data: A::default(),
        });
        self.nodes[parent.index()].children.push(id);
        self.index.insert((parent, symbol), id);
        id
    }

    /// Symbols from the root's child down to `id`
    pub fn path(&self, id: NodeId) -> Vec<SymbolId> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if node.parent.is_some() {
                path.push(node.symbol);
            }
            current = node.parent;
        }
        path.reverse();
        path
    }
}

/// Sample counts: weight landing exactly on a node, and weight passing
/// through it
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountAugment {
    pub self_weight: u64,
    pub total_weight: u64,
}

impl CountAugment {
    pub fn add(&mut self, weight: u64, is_leaf: bool) {
        self.total_weight += weight;
        if is_leaf {
            self.self_weight += weight;
        }
    }
}
