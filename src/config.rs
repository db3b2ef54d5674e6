//! Engine configuration toggles.

use std::path::PathBuf;

/// Runtime knobs, all defaulting to off. The `with_*` builders mirror how
/// the front end usually sets them from its own config file.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Disable the greedy fuser: one kernel per compute instruction.
    pub serial_fusion: bool,
    /// Emit `#pragma omp parallel for` on outermost loops and compile the
    /// kernels with OpenMP.
    pub compiler_openmp: bool,
    /// Also emit `simd` clauses on innermost compatible loops.
    pub compiler_openmp_simd: bool,
    /// Accumulate profiling counters, printable via `Engine::pprint_stats`.
    pub prof: bool,
    /// Dump each kernel's block tree before emission.
    pub verbose: bool,
    /// Write the dependency DAG as Graphviz into `dump_dir`.
    pub dump_graph: bool,
    /// Directory for DAG dumps.
    pub dump_dir: PathBuf,
    /// Override the C compiler binary; auto-detected when `None`.
    pub compiler_cmd: Option<String>,
    /// Extra flags appended to every compiler invocation.
    pub compiler_flags: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            serial_fusion: false,
            compiler_openmp: false,
            compiler_openmp_simd: false,
            prof: false,
            verbose: false,
            dump_graph: false,
            dump_dir: PathBuf::from("."),
            compiler_cmd: None,
            compiler_flags: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serial_fusion(mut self) -> Self {
        self.serial_fusion = true;
        self
    }

    pub fn with_openmp(mut self) -> Self {
        self.compiler_openmp = true;
        self
    }

    pub fn with_openmp_simd(mut self) -> Self {
        self.compiler_openmp = true;
        self.compiler_openmp_simd = true;
        self
    }

    pub fn with_prof(mut self) -> Self {
        self.prof = true;
        self
    }

    pub fn with_verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn with_dump_graph(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_graph = true;
        self.dump_dir = dir.into();
        self
    }

    pub fn with_compiler(mut self, cmd: impl Into<String>) -> Self {
        self.compiler_cmd = Some(cmd.into());
        self
    }

    pub fn with_compiler_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compiler_flags = flags.into_iter().map(Into::into).collect();
        self
    }
}
