//! The batch driver.
//!
//! `Engine::execute` takes one instruction batch through the whole
//! pipeline: constructor marking, system filtering, singleton blocks,
//! fusion, pruning, per-kernel code generation, Store lookup, invocation
//! with the live data pointers, and base reclamation. Batches run in issue
//! order and either complete or fail as a whole.

use log::{debug, info};
use rustc_hash::FxHashSet;

use crate::base::BaseHandle;
use crate::basedb::BaseDb;
use crate::block::Block;
use crate::codegen::write_kernel;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fuser::{fuser_greedy, fuser_serial, fuser_singleton, remove_system_only_blocks};
use crate::graph::{to_dot, Dag};
use crate::instruction::{Instruction, Opcode};
use crate::kernel::Kernel;
use crate::store::{KernelFn, Store};

pub struct Engine {
    config: EngineConfig,
    store: Store,
    dump_count: usize,
    // Profiling counters, reported by `pprint_stats`.
    num_base_arrays: u64,
    num_temp_arrays: u64,
    totalwork: u64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = Store::new(&config)?;
        Ok(Engine {
            config,
            store,
            dump_count: 0,
            num_base_arrays: 0,
            num_temp_arrays: 0,
            totalwork: 0,
        })
    }

    /// Executes one batch of instructions. No partial progress survives an
    /// error: the batch either runs to completion or fails as a whole.
    pub fn execute(&mut self, mut batch: Vec<Instruction>) -> Result<()> {
        for instr in &batch {
            instr.validate()?;
        }
        check_input_buffers(&batch)?;
        set_constructor_flag(&mut batch);

        // Keep compute instructions and the frees that shape base
        // lifetimes; sync, none, and discard have nothing to execute.
        let instrs: Vec<Instruction> = batch
            .into_iter()
            .filter(|i| !i.opcode.is_system() || i.opcode == Opcode::Free)
            .collect();
        if instrs.is_empty() {
            return Ok(());
        }
        info!("executing batch of {} instruction(s)", instrs.len());

        if self.config.prof {
            self.totalwork += instrs
                .iter()
                .filter(|i| !i.opcode.is_system())
                .filter_map(|i| i.out_view())
                .map(|v| v.nelem() as u64)
                .sum::<u64>();
        }

        let mut block_list = fuser_singleton(instrs);
        if self.config.serial_fusion {
            fuser_serial(&mut block_list);
        } else {
            fuser_greedy(&mut block_list);
        }
        let leftover_frees = remove_system_only_blocks(&mut block_list);

        if self.config.dump_graph {
            let dag = Dag::from_block_list(&block_list);
            let path = self
                .config
                .dump_dir
                .join(format!("dag-{}.dot", self.dump_count));
            self.dump_count += 1;
            std::fs::write(&path, to_dot(&dag, &block_list))?;
            info!("wrote dependency DAG to {}", path.display());
        }

        // Generate and compile every kernel before invoking any, so a bad
        // (opcode, type) pair or a compiler rejection leaves the batch
        // without partial progress.
        let mut staged = Vec::with_capacity(block_list.len());
        for block in &block_list {
            let loop_block = block
                .as_loop()
                .expect("top-level blocks are loop nodes")
                .clone();
            staged.push(self.stage_kernel(Kernel::new(loop_block))?);
        }
        for (kernel, func) in staged {
            self.invoke_kernel(&kernel, func)?;
        }

        // Frees scheduled in pruned system-only blocks still apply.
        for base in &leftover_frees {
            base.data_free();
        }
        Ok(())
    }

    /// Generates the kernel's source and resolves it through the Store.
    fn stage_kernel(&mut self, kernel: Kernel) -> Result<(Kernel, KernelFn)> {
        self.num_base_arrays += (kernel.non_temps().len() + kernel.temps().len()) as u64;
        self.num_temp_arrays += kernel.temps().len() as u64;

        // Ids in instruction order, so structurally equal kernels emit
        // identical source and reuse each other's binaries.
        let mut base_ids = BaseDb::new();
        for instr in kernel.all_instrs() {
            for view in instr.views() {
                base_ids.insert(&view.base);
            }
        }
        base_ids.insert_tmp(kernel.temps().iter().cloned());

        if self.config.verbose {
            println!("{}", Block::Loop(kernel.block.clone()).pprint());
        }

        let source = write_kernel(&kernel, &mut base_ids, &self.config)?;
        let func = self.store.get_function(&source)?;
        Ok((kernel, func))
    }

    fn invoke_kernel(&self, kernel: &Kernel, func: KernelFn) -> Result<()> {
        // Allocate only the bases this kernel writes; inputs were checked
        // up front and must already carry a buffer.
        let mut written: FxHashSet<BaseHandle> = FxHashSet::default();
        for instr in kernel.all_instrs() {
            if !instr.opcode.is_system() {
                if let Some(out) = instr.out_view() {
                    written.insert(out.base.clone());
                }
            }
        }
        for base in kernel.non_temps() {
            if written.contains(base) {
                base.data_malloc()?;
            }
        }
        let mut data_list: Vec<*mut std::ffi::c_void> = kernel
            .non_temps()
            .iter()
            .map(|base| base.data_ptr())
            .collect::<Result<_>>()?;

        debug!(
            "invoking kernel with {} base(s), {} contracted",
            kernel.non_temps().len(),
            kernel.temps().len()
        );
        // Safety: the pointers are the live buffers of the non-temp bases,
        // in the order the launcher expects, each at least as large as the
        // `[static n]` parameter demands; no Rust borrow of the buffers is
        // held across the call.
        unsafe {
            func(data_list.as_mut_ptr());
        }

        for base in kernel.frees() {
            base.data_free();
        }
        Ok(())
    }

    /// Prints the profiling counters accumulated under the `prof` toggle.
    pub fn pprint_stats(&self) {
        println!("[veld] Profiling:");
        println!(
            "\tKernel store hits:   {}/{}",
            self.store.num_lookups - self.store.num_lookup_misses,
            self.store.num_lookups
        );
        println!(
            "\tArray contractions:  {}/{}",
            self.num_temp_arrays, self.num_base_arrays
        );
        println!("\tTotal work: {} operations", self.totalwork);
    }
}

/// Rejects instructions that read from a base that neither has an
/// allocated buffer nor is written by an earlier instruction in the
/// batch. Such a read is malformed input, not something the engine may
/// paper over by zero-filling.
fn check_input_buffers(batch: &[Instruction]) -> Result<()> {
    let mut written: FxHashSet<BaseHandle> = FxHashSet::default();
    for instr in batch {
        if instr.opcode.is_system() {
            continue;
        }
        for op in instr.operands.iter().skip(1) {
            if let Some(view) = op.view() {
                if !view.base.is_allocated() && !written.contains(&view.base) {
                    return Err(EngineError::MalformedInstruction(format!(
                        "{} input operand {} has no allocated buffer",
                        instr.opcode.name(),
                        view.base
                    )));
                }
            }
        }
        if let Some(out) = instr.out_view() {
            written.insert(out.base.clone());
        }
    }
    Ok(())
}

/// Marks the first write to each unallocated base within the batch: that
/// instruction constructs the base, which makes it a candidate `new` for
/// array contraction.
pub fn set_constructor_flag(batch: &mut [Instruction]) {
    let mut initiated: FxHashSet<BaseHandle> = FxHashSet::default();
    for instr in batch.iter_mut() {
        instr.constructor = false;
        if instr.opcode.is_system() {
            continue;
        }
        // Only the output constructs.
        if let Some(out) = instr.out_view() {
            if !out.base.is_allocated() && !initiated.contains(&out.base) {
                initiated.insert(out.base.clone());
                instr.constructor = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{ConstVal, DType};
    use crate::view::{Operand, View};

    #[test]
    fn test_constructor_flag_marks_first_write_only() {
        let a = BaseHandle::new(DType::Float64, 8);
        let b = BaseHandle::new(DType::Float64, 8);
        a.copy_from_slice(&[0.0f64; 8]).unwrap();

        let mk = |out: &BaseHandle, input: &BaseHandle| {
            Instruction::binary(
                Opcode::Add,
                View::contiguous(out, &[8]),
                Operand::View(View::contiguous(input, &[8])),
                Operand::Const(ConstVal::Float64(1.0)),
            )
        };
        let mut batch = vec![mk(&b, &a), mk(&b, &b)];
        set_constructor_flag(&mut batch);
        assert!(batch[0].constructor);
        assert!(!batch[1].constructor); // second write to b
    }

    #[test]
    fn test_constructor_flag_skips_allocated() {
        let a = BaseHandle::new(DType::Float64, 8);
        let b = BaseHandle::new(DType::Float64, 8);
        b.copy_from_slice(&[0.0f64; 8]).unwrap();

        let mut batch = vec![Instruction::binary(
            Opcode::Add,
            View::contiguous(&b, &[8]),
            Operand::View(View::contiguous(&a, &[8])),
            Operand::Const(ConstVal::Float64(1.0)),
        )];
        set_constructor_flag(&mut batch);
        assert!(!batch[0].constructor);
    }

    #[test]
    fn test_empty_batch() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        assert!(engine.execute(Vec::new()).is_ok());
    }

    #[test]
    fn test_unwritten_input_is_rejected() {
        let a = BaseHandle::new(DType::Float64, 8); // never written
        let b = BaseHandle::new(DType::Float64, 8);
        let batch = vec![Instruction::binary(
            Opcode::Add,
            View::contiguous(&b, &[8]),
            Operand::View(View::contiguous(&a, &[8])),
            Operand::Const(ConstVal::Float64(1.0)),
        )];
        assert!(matches!(
            check_input_buffers(&batch),
            Err(EngineError::MalformedInstruction(_))
        ));
    }

    #[test]
    fn test_input_written_earlier_in_batch_is_accepted() {
        let a = BaseHandle::new(DType::Float64, 8);
        a.copy_from_slice(&[0.0f64; 8]).unwrap();
        let b = BaseHandle::new(DType::Float64, 8);
        let c = BaseHandle::new(DType::Float64, 8);

        let mk = |out: &BaseHandle, input: &BaseHandle| {
            Instruction::binary(
                Opcode::Add,
                View::contiguous(out, &[8]),
                Operand::View(View::contiguous(input, &[8])),
                Operand::Const(ConstVal::Float64(1.0)),
            )
        };
        // b is unallocated but produced by the first instruction.
        let batch = vec![mk(&b, &a), mk(&c, &b)];
        assert!(check_input_buffers(&batch).is_ok());
    }

    #[test]
    fn test_free_of_unallocated_base_is_accepted() {
        let a = BaseHandle::new(DType::Float64, 8);
        let batch = vec![Instruction::free(View::contiguous(&a, &[8]))];
        assert!(check_input_buffers(&batch).is_ok());
    }
}
