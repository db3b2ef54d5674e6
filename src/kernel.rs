//! A fused block dressed up for execution.
//!
//! The kernel caches what the driver and the code generator need from a
//! block tree: the non-contracted bases in a stable first-touch order (the
//! order of the `execute` parameters and of the launcher's data list), the
//! contracted temporaries, the bases to free afterwards, and whether the
//! generated source needs the random header.

use rustc_hash::FxHashSet;

use crate::base::BaseHandle;
use crate::block::LoopBlock;
use crate::instruction::{InstrPtr, Opcode};

#[derive(Debug)]
pub struct Kernel {
    pub block: LoopBlock,
    non_temps: Vec<BaseHandle>,
    temps: FxHashSet<BaseHandle>,
    frees: FxHashSet<BaseHandle>,
    use_random: bool,
}

impl Kernel {
    pub fn new(block: LoopBlock) -> Self {
        let temps = block.all_temps();
        let frees = block.all_frees();
        let mut non_temps = Vec::new();
        let mut seen: FxHashSet<BaseHandle> = FxHashSet::default();
        let mut use_random = false;
        for instr in block.all_instrs() {
            if instr.opcode == Opcode::Random {
                use_random = true;
            }
            for view in instr.views() {
                if !temps.contains(&view.base) && seen.insert(view.base.clone()) {
                    non_temps.push(view.base.clone());
                }
            }
        }
        Kernel {
            block,
            non_temps,
            temps,
            frees,
            use_random,
        }
    }

    /// Bases that become `execute` parameters, in first-touch order.
    pub fn non_temps(&self) -> &[BaseHandle] {
        &self.non_temps
    }

    /// Bases contracted to loop-local scalars; never allocated.
    pub fn temps(&self) -> &FxHashSet<BaseHandle> {
        &self.temps
    }

    /// Bases to free once the kernel has run.
    pub fn frees(&self) -> &FxHashSet<BaseHandle> {
        &self.frees
    }

    pub fn use_random(&self) -> bool {
        self.use_random
    }

    pub fn all_instrs(&self) -> Vec<InstrPtr> {
        self.block.all_instrs()
    }
}
