//! Dependency DAG over blocks.
//!
//! Plain adjacency lists plus a breadth-first search; vertices are indices
//! into the block list the DAG was built from. The fuser uses the
//! path-existence query to refuse merges that would close a cycle, and the
//! `dump_graph` toggle renders the DAG as Graphviz.

use std::collections::VecDeque;
use std::ops::ControlFlow;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::base::BaseHandle;
use crate::block::Block;
use crate::instruction::InstrPtr;

/// Bases written by the block's instructions.
fn written_bases(block: &Block) -> FxHashSet<BaseHandle> {
    let mut out = FxHashSet::default();
    for instr in block.all_instrs() {
        if !instr.opcode.is_system() {
            if let Some(view) = instr.out_view() {
                out.insert(view.base.clone());
            }
        }
    }
    out
}

/// Bases read or written by the block, system instructions included; a
/// free must still be ordered after the writes it follows.
fn accessed_bases(block: &Block) -> FxHashSet<BaseHandle> {
    let mut out = FxHashSet::default();
    for instr in block.all_instrs() {
        for view in instr.views() {
            out.insert(view.base.clone());
        }
    }
    out
}

/// True iff `later` reads or writes a base that `earlier` wrote.
pub fn depends_on(later: &Block, earlier: &Block) -> bool {
    let written = written_bases(earlier);
    if written.is_empty() {
        return false;
    }
    accessed_bases(later).iter().any(|b| written.contains(b))
}

/// Dependency DAG: `adj[u]` lists the vertices that depend on `u`.
#[derive(Debug)]
pub struct Dag {
    pub adj: Vec<Vec<usize>>,
}

impl Dag {
    /// Builds the DAG for `blocks` in O(N·D): per base, the set of vertices
    /// that have touched it so far supplies the candidate edges.
    pub fn from_block_list(blocks: &[Block]) -> Dag {
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
        let mut base_touchers: FxHashMap<BaseHandle, Vec<usize>> = FxHashMap::default();

        for (v, block) in blocks.iter().enumerate() {
            let mut connecting: Vec<usize> = Vec::new();
            for base in accessed_bases(block) {
                let touchers = base_touchers.entry(base).or_default();
                connecting.extend(touchers.iter().copied());
                touchers.push(v);
            }
            connecting.sort_unstable();
            connecting.dedup();
            for &u in &connecting {
                debug_assert!(u < v);
                if depends_on(block, &blocks[u]) {
                    adj[u].push(v);
                }
            }
        }
        for edges in adj.iter_mut() {
            edges.sort_unstable();
            edges.dedup();
        }
        Dag { adj }
    }

    pub fn num_vertices(&self) -> usize {
        self.adj.len()
    }

    /// Breadth-first search from `src`. The visitor examines each edge and
    /// may stop the traversal by returning `ControlFlow::Break`.
    pub fn bfs_edges<F>(&self, src: usize, mut visit: F) -> ControlFlow<()>
    where
        F: FnMut(usize, usize) -> ControlFlow<()>,
    {
        let mut seen = vec![false; self.adj.len()];
        let mut queue = VecDeque::new();
        seen[src] = true;
        queue.push_back(src);
        while let Some(u) = queue.pop_front() {
            for &w in &self.adj[u] {
                visit(u, w)?;
                if !seen[w] {
                    seen[w] = true;
                    queue.push_back(w);
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Is there a path from `a` to `b`? With `only_long_path` the direct
    /// edge `(a, b)` is ignored, which asks whether a transitive dependency
    /// exists besides the one a merge would absorb.
    pub fn path_exist(&self, a: usize, b: usize, only_long_path: bool) -> bool {
        self.bfs_edges(a, |u, w| {
            if w == b && !(only_long_path && u == a) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .is_break()
    }
}

/// Bytes of storage a merge of `a` into `b` would contract: the bases born
/// in `a` and freed in `b`.
fn edge_weight(a: &Block, b: &Block) -> u64 {
    let (news, frees) = match (a.as_loop(), b.as_loop()) {
        (Some(a), Some(b)) => (a.all_news(), b.all_frees()),
        _ => return 0,
    };
    news.intersection(&frees).map(|b| b.size_bytes() as u64).sum()
}

/// Bytes moved in and out of memory by the block: the sizes of its
/// non-contracted bases.
fn block_cost(block: &Block) -> u64 {
    let temps = match block.as_loop() {
        Some(l) => l.all_temps(),
        None => FxHashSet::default(),
    };
    let mut seen: FxHashSet<BaseHandle> = FxHashSet::default();
    let mut total = 0u64;
    for instr in block.all_instrs() {
        for view in instr.views() {
            if !temps.contains(&view.base) && seen.insert(view.base.clone()) {
                total += view.base.size_bytes() as u64;
            }
        }
    }
    total
}

/// Renders the DAG in Graphviz DOT format, one box per kernel.
pub fn to_dot(dag: &Dag, blocks: &[Block]) -> String {
    let mut out = String::from("digraph {\n");
    let total: u64 = blocks.iter().map(block_cost).sum();
    out.push_str("labelloc=\"t\";\n");
    out.push_str(&format!("label=\"Total cost: {} bytes\";\n", total));
    out.push_str("graph [fontname=\"Courier New\"]\n");
    out.push_str("node [shape=box, fontname=\"Courier New\"]\n");

    for (v, block) in blocks.iter().enumerate() {
        let instrs: Vec<InstrPtr> = block.all_instrs();
        let mut label = format!("Kernel {}, cost: {} bytes\\l", v, block_cost(block));
        for instr in instrs {
            label.push_str(&format!("{}\\l", *instr));
        }
        out.push_str(&format!("n{} [label=\"{}\"]\n", v, label.replace('"', "'")));
    }
    for (u, edges) in dag.adj.iter().enumerate() {
        for &w in edges {
            out.push_str(&format!(
                "n{} -> n{} [label=\" {} bytes\"]\n",
                u,
                w,
                edge_weight(&blocks[u], &blocks[w])
            ));
        }
    }
    out.push_str("}\n");
    out
}
