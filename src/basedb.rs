//! Per-kernel registry of bases.
//!
//! Each kernel assigns its bases small integer ids in first-touch order, so
//! structurally identical kernels produce identical source and hit the
//! Store cache. The registry also carries the per-base flags the code
//! generator threads through emission: contracted temporary, scalar
//! replaced, OpenMP atomic, OpenMP critical.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::base::BaseHandle;

#[derive(Debug, Default)]
pub struct BaseDb {
    ids: FxHashMap<BaseHandle, usize>,
    order: Vec<BaseHandle>,
    tmps: FxHashSet<BaseHandle>,
    scalar_replaced: FxHashSet<BaseHandle>,
    omp_atomic: FxHashSet<BaseHandle>,
    omp_critical: FxHashSet<BaseHandle>,
}

impl BaseDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `base`, assigning the next id on first touch.
    pub fn insert(&mut self, base: &BaseHandle) -> usize {
        if let Some(&id) = self.ids.get(base) {
            return id;
        }
        let id = self.order.len();
        self.ids.insert(base.clone(), id);
        self.order.push(base.clone());
        id
    }

    /// The id of a registered base.
    pub fn id(&self, base: &BaseHandle) -> usize {
        self.ids[base]
    }

    /// All registered bases in insertion order.
    pub fn bases(&self) -> &[BaseHandle] {
        &self.order
    }

    pub fn insert_tmp<I: IntoIterator<Item = BaseHandle>>(&mut self, bases: I) {
        self.tmps.extend(bases);
    }

    pub fn is_tmp(&self, base: &BaseHandle) -> bool {
        self.tmps.contains(base)
    }

    pub fn insert_scalar_replacement(&mut self, base: &BaseHandle) {
        self.scalar_replaced.insert(base.clone());
    }

    /// Clears the scalar-replacement flag after the store-back, so the
    /// state never leaks into a sibling subtree.
    pub fn erase_scalar_replacement(&mut self, base: &BaseHandle) {
        self.scalar_replaced.remove(base);
    }

    pub fn is_scalar_replaced(&self, base: &BaseHandle) -> bool {
        self.scalar_replaced.contains(base)
    }

    pub fn insert_openmp_atomic(&mut self, base: &BaseHandle) {
        self.omp_atomic.insert(base.clone());
    }

    pub fn is_openmp_atomic(&self, base: &BaseHandle) -> bool {
        self.omp_atomic.contains(base)
    }

    pub fn insert_openmp_critical(&mut self, base: &BaseHandle) {
        self.omp_critical.insert(base.clone());
    }

    pub fn is_openmp_critical(&self, base: &BaseHandle) -> bool {
        self.omp_critical.contains(base)
    }
}
