//! Fusion of singleton blocks into nested kernels.
//!
//! `fuser_singleton` turns each instruction into its own nested block;
//! `fuser_greedy` then repeatedly merges the first legal adjacent pair
//! until a fixpoint. The alternate `fuser_serial` keeps one kernel per
//! compute instruction and only absorbs trailing system blocks.

use log::{debug, trace};
use rustc_hash::FxHashSet;

use crate::base::BaseHandle;
use crate::block::{create_nested_block, merge, Block, LoopBlock};
use crate::graph::Dag;
use crate::instruction::{Instruction, Opcode};

/// Builds one singleton block per instruction. Reshapable instructions are
/// collapsed to their flat size immediately, so equal-sized elementwise
/// streams meet at a common rank regardless of their original shapes.
pub fn fuser_singleton(instrs: Vec<Instruction>) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(instrs.len());
    for instr in instrs {
        let mut news = FxHashSet::default();
        let mut frees = FxHashSet::default();
        if instr.constructor {
            if let Some(out) = instr.out_view() {
                news.insert(out.base.clone());
            }
        }
        if instr.opcode == Opcode::Free {
            if let Some(view) = instr.out_view() {
                frees.insert(view.base.clone());
            }
        }
        // A natural extent never fails the divisibility check.
        let block = create_nested_block(vec![instr], news, frees, 0, None)
            .expect("singleton construction cannot fail");
        blocks.push(Block::Loop(block));
    }
    blocks
}

/// Total iteration size of a reshapable block: the product of the
/// dominating shape from the block's rank down.
fn suffix_size(block: &LoopBlock) -> i64 {
    let instrs = block.all_instrs();
    let shape = instrs[0].dominating_shape();
    shape[block.rank..].iter().product()
}

/// Bases accessed by the block's compute instructions. System instructions
/// are excluded: a free of a sweep output in a later block is harmless,
/// only value consumers conflict.
fn compute_bases(block: &LoopBlock) -> FxHashSet<BaseHandle> {
    let mut out = FxHashSet::default();
    for instr in block.all_instrs() {
        if !instr.opcode.is_system() {
            for view in instr.views() {
                out.insert(view.base.clone());
            }
        }
    }
    out
}

/// Tests whether blocks `va` and `vb` (adjacent, `va` first) may merge and
/// returns the merged block if so.
fn try_merge(blocks: &[Block], va: usize, vb: usize, dag: &Dag) -> Option<LoopBlock> {
    let a = blocks[va].as_loop()?;
    let b = blocks[vb].as_loop()?;

    if a.rank != b.rank {
        return None;
    }

    // Merging may not close a cycle: a transitive dependency besides the
    // direct one would end up inside the fused kernel.
    if dag.path_exist(va, vb, true) {
        return None;
    }

    // A sweep output is complete only after its loop finishes; no compute
    // instruction of the partner may touch it.
    if a.sweep_outputs().intersection(&compute_bases(b)).next().is_some()
        || b.sweep_outputs().intersection(&compute_bases(a)).next().is_some()
    {
        return None;
    }

    if a.size == b.size {
        return Some(merge(a, b));
    }

    // Unequal sizes: one side must be reshapable to the other's extent.
    if a.reshapable && suffix_size(a) % b.size == 0 {
        let rebuilt = rebuild_with_extent(a, b.size)?;
        return Some(merge(&rebuilt, b));
    }
    if b.reshapable && suffix_size(b) % a.size == 0 {
        let rebuilt = rebuild_with_extent(b, a.size)?;
        return Some(merge(a, &rebuilt));
    }
    None
}

/// Reconstructs a reshapable block so its extent at the block's rank is
/// `extent`. Returns `None` when `extent` does not divide the flat size;
/// the caller abandons the merge.
fn rebuild_with_extent(block: &LoopBlock, extent: i64) -> Option<LoopBlock> {
    let instrs: Vec<Instruction> = block
        .all_instrs()
        .iter()
        .map(|p| p.0.as_ref().clone())
        .collect();
    create_nested_block(
        instrs,
        block.news.clone(),
        block.frees.clone(),
        block.rank,
        Some(extent),
    )
}

/// Greedy fusion: scan left to right, take the first legal adjacent merge,
/// and restart until no merge applies. The first legal merge always wins,
/// so the result is deterministic and independent of set iteration order.
pub fn fuser_greedy(blocks: &mut Vec<Block>) {
    loop {
        let dag = Dag::from_block_list(blocks);
        let mut merged_at = None;
        for i in 0..blocks.len().saturating_sub(1) {
            if let Some(merged) = try_merge(blocks, i, i + 1, &dag) {
                merged_at = Some((i, merged));
                break;
            }
        }
        match merged_at {
            Some((i, merged)) => {
                trace!("fused block {} into block {}", i + 1, i);
                blocks[i] = Block::Loop(merged);
                blocks.remove(i + 1);
            }
            None => break,
        }
    }
    debug!("greedy fusion settled on {} kernel(s)", blocks.len());
}

/// Serial mode: no fusion between compute instructions. System-only blocks
/// are still folded into the preceding kernel so frees keep their kernel
/// boundary.
pub fn fuser_serial(blocks: &mut Vec<Block>) {
    let mut out: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks.drain(..) {
        let absorb = match (out.last(), &block) {
            (Some(Block::Loop(_)), Block::Loop(_)) => block.is_system_only(),
            _ => false,
        };
        if absorb {
            if let (Some(Block::Loop(prev)), Block::Loop(cur)) = (out.last_mut(), &block) {
                absorb_system(prev, cur);
                continue;
            }
        }
        out.push(block);
    }
    *blocks = out;
    debug!("serial fusion kept {} kernel(s)", blocks.len());
}

/// Folds a system-only block into `prev`: children appended, base sets
/// unioned, temps recomputed. Extents need not match since system leaves
/// emit no loop body.
fn absorb_system(prev: &mut LoopBlock, system: &LoopBlock) {
    prev.children.extend(system.children.iter().cloned());
    prev.news.extend(system.news.iter().cloned());
    prev.frees.extend(system.frees.iter().cloned());
    prev.temps = prev.news.intersection(&prev.frees).cloned().collect();
}

/// Drops loop blocks whose every instruction is a system opcode, anywhere
/// in the trees. Returns the bases their frees scheduled; the caller still
/// owes those a `data_free`.
pub fn remove_system_only_blocks(blocks: &mut Vec<Block>) -> FxHashSet<BaseHandle> {
    let mut freed = FxHashSet::default();
    prune(blocks, &mut freed);
    freed
}

fn prune(blocks: &mut Vec<Block>, freed: &mut FxHashSet<BaseHandle>) {
    blocks.retain_mut(|block| match block {
        Block::Instr(_) => true,
        Block::Loop(l) => {
            if l.children.iter().all(|c| c.is_system_only()) {
                freed.extend(l.all_frees());
                false
            } else {
                prune(&mut l.children, freed);
                true
            }
        }
    });
}
