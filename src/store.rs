//! Compiled-kernel store.
//!
//! Maps generated source text to a callable launcher. Misses are compiled
//! with the system C compiler into a shared object inside a temporary
//! directory and loaded with `libloading`; the library stays alive in the
//! cache for the store's lifetime, so the returned function pointers remain
//! valid. On a compile failure the offending source file is persisted and
//! its path carried in the error.

use std::ffi::c_void;
use std::path::PathBuf;
use std::process::Command;

use libloading::{Library, Symbol};
use log::{debug, trace};
use rustc_hash::FxHashMap;
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Entry point of a compiled kernel: takes the list of data pointers in
/// the order the source declared them.
pub type KernelFn = unsafe extern "C" fn(*mut *mut c_void);

struct CompiledKernel {
    // Keeps the shared object mapped while `func` is handed out.
    _library: Library,
    func: KernelFn,
}

pub struct Store {
    compiler_cmd: String,
    compiler_flags: Vec<String>,
    openmp: bool,
    dir: TempDir,
    cache: FxHashMap<String, CompiledKernel>,
    counter: usize,
    /// Lookup statistics, read by the engine's profiling report.
    pub num_lookups: u64,
    pub num_lookup_misses: u64,
}

impl Store {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let compiler_cmd = match &config.compiler_cmd {
            Some(cmd) => cmd.clone(),
            None => detect_compiler(),
        };
        Ok(Store {
            compiler_cmd,
            compiler_flags: config.compiler_flags.clone(),
            openmp: config.compiler_openmp,
            dir: TempDir::with_prefix("veld-kernels-")?,
            cache: FxHashMap::default(),
            counter: 0,
            num_lookups: 0,
            num_lookup_misses: 0,
        })
    }

    /// Returns the launcher for `source`, compiling on a cache miss. The
    /// cache key is the full source text.
    pub fn get_function(&mut self, source: &str) -> Result<KernelFn> {
        self.num_lookups += 1;
        if let Some(kernel) = self.cache.get(source) {
            trace!("kernel store hit");
            return Ok(kernel.func);
        }
        self.num_lookup_misses += 1;

        let kernel = self.compile(source)?;
        let func = kernel.func;
        self.cache.insert(source.to_string(), kernel);
        Ok(func)
    }

    fn compile(&mut self, source: &str) -> Result<CompiledKernel> {
        if source.contains("random123.h") {
            self.write_random_header()?;
        }

        let source_path = self.dir.path().join(format!("kernel_{}.c", self.counter));
        let lib_path = self.dir.path().join(format!("kernel_{}.so", self.counter));
        self.counter += 1;
        std::fs::write(&source_path, source)?;

        let mut cmd = Command::new(&self.compiler_cmd);
        cmd.arg("-shared")
            .arg("-fPIC")
            .arg("-O2")
            .arg("-std=c99")
            .arg("-I")
            .arg(self.dir.path());
        if self.openmp {
            cmd.arg("-fopenmp");
        }
        for flag in &self.compiler_flags {
            cmd.arg(flag);
        }
        cmd.arg("-o").arg(&lib_path).arg(&source_path);

        debug!("compiling kernel: {:?}", cmd);
        let output = cmd
            .output()
            .map_err(|e| EngineError::LoadFailed(format!(
                "failed to run compiler '{}': {}",
                self.compiler_cmd, e
            )))?;
        if !output.status.success() {
            let diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
            let kept = persist_failed_source(&source_path);
            return Err(EngineError::CompileFailed {
                diagnostics,
                source_path: kept,
            });
        }

        let library = unsafe {
            Library::new(&lib_path).map_err(|e| EngineError::LoadFailed(e.to_string()))?
        };
        let func = unsafe {
            let sym: Symbol<KernelFn> = library
                .get(b"launcher")
                .map_err(|e| EngineError::LoadFailed(e.to_string()))?;
            *sym
        };
        Ok(CompiledKernel {
            _library: library,
            func,
        })
    }

    fn write_random_header(&self) -> Result<()> {
        let path = self.dir.path().join("random123.h");
        if path.exists() {
            return Ok(());
        }
        // A counter-based generator: pure in (seed, index), so every fused
        // or threaded evaluation of an element sees the same value.
        std::fs::write(
            &path,
            "#ifndef VELD_RANDOM123_H\n\
             #define VELD_RANDOM123_H\n\
             #include <stdint.h>\n\
             static inline uint64_t random123(uint64_t seed, uint64_t index) {\n\
             \x20   uint64_t z = seed + index * 0x9E3779B97F4A7C15ull;\n\
             \x20   z = (z ^ (z >> 30)) * 0xBF58476D1CE4E5B9ull;\n\
             \x20   z = (z ^ (z >> 27)) * 0x94D049BB133111EBull;\n\
             \x20   return z ^ (z >> 31);\n\
             }\n\
             #endif\n",
        )?;
        Ok(())
    }
}

/// Moves a rejected source file out of the store's temporary directory so
/// it survives for debugging.
fn persist_failed_source(source_path: &std::path::Path) -> PathBuf {
    let kept = std::env::temp_dir().join(format!(
        "veld-failed-{}",
        source_path.file_name().unwrap().to_string_lossy()
    ));
    match std::fs::copy(source_path, &kept) {
        Ok(_) => kept,
        Err(_) => source_path.to_path_buf(),
    }
}

/// Prefers clang, falls back to gcc, then the POSIX cc.
fn detect_compiler() -> String {
    for candidate in ["clang", "gcc", "cc"] {
        if Command::new(candidate).arg("--version").output().is_ok() {
            return candidate.to_string();
        }
    }
    "cc".to_string()
}
