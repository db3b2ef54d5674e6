//! Contiguous typed buffers shared by views.
//!
//! A [`Base`] owns the storage behind one or more views. The front end
//! creates bases and keeps them alive; the engine only triggers allocation
//! on first write and releases buffers when a kernel's free set fires.
//! Identity is the allocation address, so handles hash and compare by
//! pointer, never by contents.

use std::cell::RefCell;
use std::os::raw::c_void;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::dtype::{DType, Scalar};
use crate::error::{EngineError, Result};

static NEXT_LABEL: AtomicUsize = AtomicUsize::new(0);

/// A contiguous typed buffer of `nelem` elements.
///
/// `data` is `None` until the engine allocates it; system free instructions
/// drop it again.
#[derive(Debug)]
pub struct Base {
    pub dtype: DType,
    pub nelem: i64,
    pub data: Option<Vec<u8>>,
    label: usize,
}

/// Shared handle to a [`Base`] with pointer identity.
#[derive(Clone)]
pub struct BaseHandle(Rc<RefCell<Base>>);

impl BaseHandle {
    pub fn new(dtype: DType, nelem: i64) -> Self {
        let label = NEXT_LABEL.fetch_add(1, Ordering::Relaxed);
        BaseHandle(Rc::new(RefCell::new(Base {
            dtype,
            nelem,
            data: None,
            label,
        })))
    }

    pub fn dtype(&self) -> DType {
        self.0.borrow().dtype
    }

    pub fn nelem(&self) -> i64 {
        self.0.borrow().nelem
    }

    /// Total buffer size in bytes.
    pub fn size_bytes(&self) -> usize {
        let b = self.0.borrow();
        b.nelem as usize * b.dtype.size_bytes()
    }

    /// A small per-process label, stable for the lifetime of the base.
    /// Only used for pretty printing and Graphviz output.
    pub fn label(&self) -> usize {
        self.0.borrow().label
    }

    pub fn is_allocated(&self) -> bool {
        self.0.borrow().data.is_some()
    }

    /// Allocates the buffer zero-filled if it is not already allocated.
    pub fn data_malloc(&self) -> Result<()> {
        let mut b = self.0.borrow_mut();
        if b.data.is_none() {
            let size = b.nelem as usize * b.dtype.size_bytes();
            let mut buf = Vec::new();
            if buf.try_reserve_exact(size).is_err() {
                return Err(EngineError::AllocationFailed(size));
            }
            buf.resize(size, 0);
            b.data = Some(buf);
        }
        Ok(())
    }

    /// Releases the buffer. A no-op when the base was never allocated,
    /// which is the case for contracted temporaries.
    pub fn data_free(&self) {
        self.0.borrow_mut().data = None;
    }

    /// Raw pointer to the buffer, for handing to a compiled kernel.
    ///
    /// The pointer stays valid until the next `data_free`; the `Vec` is
    /// never reallocated after `data_malloc`.
    pub fn data_ptr(&self) -> Result<*mut c_void> {
        let mut b = self.0.borrow_mut();
        match b.data.as_mut() {
            Some(buf) => Ok(buf.as_mut_ptr() as *mut c_void),
            None => Err(EngineError::MalformedInstruction(format!(
                "base a{} has no allocated buffer",
                b.label
            ))),
        }
    }

    /// Copies `values` into the buffer, allocating it first.
    pub fn copy_from_slice<T: Scalar>(&self, values: &[T]) -> Result<()> {
        self.data_malloc()?;
        let mut b = self.0.borrow_mut();
        let buf = b.data.as_mut().unwrap();
        for (i, v) in values.iter().enumerate() {
            let bytes = v.to_bytes();
            buf[i * bytes.len()..(i + 1) * bytes.len()].copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Reads the whole buffer out as a typed vector.
    pub fn to_vec<T: Scalar>(&self) -> Vec<T> {
        let b = self.0.borrow();
        let buf = b.data.as_ref().expect("base is not allocated");
        let size = std::mem::size_of::<T>().max(1);
        (0..b.nelem as usize)
            .map(|i| T::from_bytes(&buf[i * size..]))
            .collect()
    }
}

impl PartialEq for BaseHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BaseHandle {}

impl std::hash::Hash for BaseHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for BaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.borrow();
        write!(f, "a{}<{:?}, {}>", b.label, b.dtype, b.nelem)
    }
}

impl std::fmt::Display for BaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a{}", self.0.borrow().label)
    }
}
