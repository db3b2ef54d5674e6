//! The fused loop-nest representation.
//!
//! A [`Block`] is either an instruction leaf or a loop node. A loop node at
//! rank `r` iterates dimension `r` of the dominating shape and contains loop
//! nodes at rank `r + 1` or instruction leaves. Sweep instructions are
//! registered on the loop node whose rank equals their axis.

use rustc_hash::FxHashSet;

use crate::base::BaseHandle;
use crate::instruction::{InstrPtr, Instruction};

/// An instruction leaf. `rank` is the depth of the enclosing nest and only
/// exists to make pretty printing line up.
#[derive(Debug, Clone)]
pub struct InstrBlock {
    pub instr: InstrPtr,
    pub rank: usize,
}

/// A loop node: one dimension of a fused loop nest.
#[derive(Debug, Clone)]
pub struct LoopBlock {
    /// Which dimension of the dominating shape this loop iterates.
    pub rank: usize,
    /// Extent along that dimension.
    pub size: i64,
    pub children: Vec<Block>,
    /// Sweep instructions whose axis equals `rank`.
    pub sweeps: FxHashSet<InstrPtr>,
    /// Bases first written inside this subtree.
    pub news: FxHashSet<BaseHandle>,
    /// Bases freed after this subtree.
    pub frees: FxHashSet<BaseHandle>,
    /// `news ∩ frees`: candidates for array contraction.
    pub temps: FxHashSet<BaseHandle>,
    /// Whether trailing dimensions may be collapsed or split.
    pub reshapable: bool,
}

#[derive(Debug, Clone)]
pub enum Block {
    Instr(InstrBlock),
    Loop(LoopBlock),
}

impl Block {
    pub fn is_instr(&self) -> bool {
        matches!(self, Block::Instr(_))
    }

    pub fn as_loop(&self) -> Option<&LoopBlock> {
        match self {
            Block::Loop(l) => Some(l),
            Block::Instr(_) => None,
        }
    }

    pub fn as_instr(&self) -> Option<&InstrPtr> {
        match self {
            Block::Instr(i) => Some(&i.instr),
            Block::Loop(_) => None,
        }
    }

    /// Collects every instruction in the subtree in program order.
    pub fn all_instrs(&self) -> Vec<InstrPtr> {
        let mut out = Vec::new();
        self.collect_instrs(&mut out);
        out
    }

    fn collect_instrs(&self, out: &mut Vec<InstrPtr>) {
        match self {
            Block::Instr(i) => out.push(i.instr.clone()),
            Block::Loop(l) => {
                for child in &l.children {
                    child.collect_instrs(out);
                }
            }
        }
    }

    /// True iff every instruction in the subtree is a system opcode.
    pub fn is_system_only(&self) -> bool {
        match self {
            Block::Instr(i) => i.instr.opcode.is_system(),
            Block::Loop(l) => l.children.iter().all(|c| c.is_system_only()),
        }
    }

    pub fn pprint(&self) -> String {
        let mut out = String::new();
        self.pprint_into(&mut out);
        out
    }

    fn pprint_into(&self, out: &mut String) {
        match self {
            Block::Instr(i) => {
                out.push_str(&" ".repeat(i.rank * 4));
                out.push_str(&format!("{}\n", *i.instr));
            }
            Block::Loop(l) => {
                out.push_str(&" ".repeat(l.rank * 4));
                out.push_str(&format!("rank: {}, size: {}", l.rank, l.size));
                if !l.sweeps.is_empty() {
                    let mut names: Vec<String> =
                        l.sweeps.iter().map(|i| i.opcode.name().to_string()).collect();
                    names.sort();
                    out.push_str(&format!(", sweeps: {{{}}}", names.join(",")));
                }
                if l.reshapable {
                    out.push_str(", reshapable");
                }
                for (tag, set) in [("news", &l.news), ("frees", &l.frees), ("temps", &l.temps)] {
                    if !set.is_empty() {
                        let mut labels: Vec<String> = set.iter().map(|b| b.to_string()).collect();
                        labels.sort();
                        out.push_str(&format!(", {}: {{{}}}", tag, labels.join(",")));
                    }
                }
                if !l.children.is_empty() {
                    out.push_str(", block list:\n");
                    for child in &l.children {
                        child.pprint_into(out);
                    }
                }
            }
        }
    }
}

impl LoopBlock {
    /// True iff no child is a loop node.
    pub fn is_innermost(&self) -> bool {
        self.children.iter().all(|c| c.is_instr())
    }

    pub fn all_instrs(&self) -> Vec<InstrPtr> {
        let mut out = Vec::new();
        for child in &self.children {
            child.collect_instrs(&mut out);
        }
        out
    }

    /// Every base touched by any instruction in the subtree.
    pub fn all_bases(&self) -> FxHashSet<BaseHandle> {
        let mut out = FxHashSet::default();
        for instr in self.all_instrs() {
            for view in instr.views() {
                out.insert(view.base.clone());
            }
        }
        out
    }

    /// Union of `news` over the subtree.
    pub fn all_news(&self) -> FxHashSet<BaseHandle> {
        let mut out = self.news.clone();
        for child in &self.children {
            if let Block::Loop(l) = child {
                out.extend(l.all_news());
            }
        }
        out
    }

    /// Union of `frees` over the subtree.
    pub fn all_frees(&self) -> FxHashSet<BaseHandle> {
        let mut out = self.frees.clone();
        for child in &self.children {
            if let Block::Loop(l) = child {
                out.extend(l.all_frees());
            }
        }
        out
    }

    /// Union of `temps` over the subtree.
    pub fn all_temps(&self) -> FxHashSet<BaseHandle> {
        let mut out = self.temps.clone();
        for child in &self.children {
            if let Block::Loop(l) = child {
                out.extend(l.all_temps());
            }
        }
        out
    }

    /// Output bases of sweep instructions anywhere in the subtree. A merge
    /// partner may not touch these: a sweep output is complete only after
    /// its loop finishes.
    pub fn sweep_outputs(&self) -> FxHashSet<BaseHandle> {
        let mut out = FxHashSet::default();
        for instr in self.all_instrs() {
            if instr.opcode.is_sweep() {
                if let Some(view) = instr.out_view() {
                    out.insert(view.base.clone());
                }
            }
        }
        out
    }

    /// Returns a copy of the subtree with `target` replaced by `with`.
    /// Used by loop peeling to substitute identity-copies for sweeps.
    pub fn replace_instr(&self, target: &InstrPtr, with: Instruction) -> LoopBlock {
        let with = InstrPtr::new(with);
        let mut ret = self.clone();
        ret.children = self
            .children
            .iter()
            .map(|child| match child {
                Block::Instr(i) if i.instr == *target => Block::Instr(InstrBlock {
                    instr: with.clone(),
                    rank: i.rank,
                }),
                Block::Instr(i) => Block::Instr(i.clone()),
                Block::Loop(l) => Block::Loop(l.replace_instr(target, with.0.as_ref().clone())),
            })
            .collect();
        ret
    }

    /// Checks the structural invariants of the nest. Only used in debug
    /// assertions and tests.
    pub fn validate(&self) -> bool {
        for child in &self.children {
            match child {
                Block::Loop(l) => {
                    if l.rank != self.rank + 1 || !l.validate() {
                        return false;
                    }
                }
                Block::Instr(_) => {}
            }
        }
        // Sweeps registered here must actually sweep this rank.
        self.sweeps
            .iter()
            .all(|instr| instr.sweep_axis() == Some(self.rank))
    }
}

/// Builds the nested block for `instrs`, which must share a dominating
/// shape. `news` and `frees` are the bases born/killed in this block;
/// `size_of_rank_dim` forces the extent at `rank` for reshapable blocks
/// (`None` collapses to the full suffix size).
///
/// Returns `None` when a forced extent does not divide the suffix size.
pub fn create_nested_block(
    mut instrs: Vec<Instruction>,
    news: FxHashSet<BaseHandle>,
    frees: FxHashSet<BaseHandle>,
    rank: usize,
    size_of_rank_dim: Option<i64>,
) -> Option<LoopBlock> {
    assert!(!instrs.is_empty(), "create_nested_block: empty instruction list");

    let reshapable = instrs.iter().all(|i| i.is_reshapable())
        && instrs
            .iter()
            .all(|i| i.dominating_rank() == instrs[0].dominating_rank());

    if reshapable {
        for instr in instrs.iter_mut() {
            let old = instr.dominating_shape();
            let mut shape: Vec<i64> = old[..rank].to_vec();
            let suffix: i64 = old[rank..].iter().product();
            let size = size_of_rank_dim.unwrap_or(suffix);
            shape.push(size);
            if suffix != size {
                if suffix % size != 0 {
                    return None;
                }
                shape.push(suffix / size);
            }
            instr.reshape(&shape);
        }
    }

    let shape = instrs[0].dominating_shape();
    debug_assert!(instrs
        .iter()
        .filter(|i| !i.opcode.is_system())
        .all(|i| i.dominating_shape() == shape));
    debug_assert!(shape.len() > rank);

    let leaves: Vec<InstrPtr> = instrs.into_iter().map(InstrPtr::new).collect();

    // Pick up sweeps per axis.
    let mut sweeps: Vec<FxHashSet<InstrPtr>> = vec![FxHashSet::default(); shape.len()];
    for instr in &leaves {
        if let Some(axis) = instr.sweep_axis() {
            debug_assert!(axis < shape.len());
            sweeps[axis].insert(instr.clone());
        }
    }

    // Build from the innermost level outwards.
    let depth = shape.len();
    let mut children: Vec<Block> = leaves
        .into_iter()
        .map(|instr| Block::Instr(InstrBlock { instr, rank: depth }))
        .collect();
    for r in (rank + 1..depth).rev() {
        children = vec![Block::Loop(LoopBlock {
            rank: r,
            size: shape[r],
            children,
            sweeps: std::mem::take(&mut sweeps[r]),
            news: FxHashSet::default(),
            frees: FxHashSet::default(),
            temps: FxHashSet::default(),
            reshapable: false,
        })];
    }

    let temps: FxHashSet<BaseHandle> = news.intersection(&frees).cloned().collect();
    Some(LoopBlock {
        rank,
        size: shape[rank],
        children,
        sweeps: std::mem::take(&mut sweeps[rank]),
        news,
        frees,
        temps,
        reshapable,
    })
}

/// Merges two loop blocks of equal rank: children concatenated in order,
/// base sets unioned, `temps` recomputed, reshapability intersected.
/// Adjacent child loop nodes whose ranks and sizes align are merged
/// recursively.
pub fn merge(a: &LoopBlock, b: &LoopBlock) -> LoopBlock {
    debug_assert_eq!(a.rank, b.rank);
    debug_assert_eq!(a.size, b.size);

    let mut children = Vec::with_capacity(a.children.len() + b.children.len());
    children.extend(a.children.iter().cloned());
    children.extend(b.children.iter().cloned());
    let children = fuse_aligned_children(children);

    let sweeps = a.sweeps.union(&b.sweeps).cloned().collect();
    let news: FxHashSet<BaseHandle> = a.news.union(&b.news).cloned().collect();
    let frees: FxHashSet<BaseHandle> = a.frees.union(&b.frees).cloned().collect();
    let temps = news.intersection(&frees).cloned().collect();

    LoopBlock {
        rank: a.rank,
        size: a.size,
        children,
        sweeps,
        news,
        frees,
        temps,
        reshapable: a.reshapable && b.reshapable,
    }
}

fn fuse_aligned_children(children: Vec<Block>) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::with_capacity(children.len());
    for child in children {
        let fused = match (out.last(), &child) {
            (Some(Block::Loop(prev)), Block::Loop(next))
                if prev.rank == next.rank && prev.size == next.size =>
            {
                Some(merge(prev, next))
            }
            _ => None,
        };
        match fused {
            Some(merged) => {
                out.pop();
                out.push(Block::Loop(merged));
            }
            None => out.push(child),
        }
    }
    out
}
