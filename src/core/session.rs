// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession is shared by every stage of one snippet compile: the subgraph adapter, each
// Linear IR pass and the generation driver. It owns a reference to the arena, interns pass and op
// names in it, and keeps an arena-allocated trace of the lowered op sequence so two compiles of
// the same fragment can be compared op for op. SessionStats counts pass runs and modifications,
// loop splits and clones produced by tail handling, registers mapped per class, buffers and
// scratchpad bytes allocated, and the final code size. The stats are kept behind RefCell so the
// session can be passed by shared reference through the whole pipeline.

//! Arena-based compilation session management.
//!
//! All names recorded during a compile live in the session arena and share
//! its lifetime.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and optimization.
    stats: RefCell<SessionStats>,

    /// String interning for efficient storage.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Op type names in lowering order, one entry per lowered expression.
    lowered_trace: RefCell<Vec<&'arena str>>,

    /// Snippet currently being compiled.
    current_snippet: RefCell<Option<String>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            lowered_trace: RefCell::new(Vec::new()),
            current_snippet: RefCell::new(None),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T>(&self, slice: &[T]) -> &'arena [T]
    where
        T: Clone,
    {
        self.arena.alloc_slice_clone(slice)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Start a new snippet. Clears the lowered trace of the previous one.
    pub fn begin_snippet(&self, name: &str) {
        *self.current_snippet.borrow_mut() = Some(name.to_string());
        self.lowered_trace.borrow_mut().clear();
    }

    /// Name passed to the last [`begin_snippet`](Self::begin_snippet).
    pub fn current_snippet(&self) -> Option<String> {
        self.current_snippet.borrow().clone()
    }

    /// Record one run of a Linear IR or graph pass.
    pub fn record_pass_run(&self, name: &str, modified: bool) {
        let name = self.intern_str(name);
        let mut stats = self.stats.borrow_mut();
        *stats.pass_runs.entry(name.to_string()).or_insert(0) += 1;
        if modified {
            stats.passes_modified += 1;
        }
    }

    /// Record a loop split by tail handling and the number of body clones it produced.
    pub fn record_loop_split(&self, clones: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.loops_split += 1;
        stats.clones_created += clones;
    }

    pub fn record_single_evaluation(&self) {
        self.stats.borrow_mut().loops_evaluated_once += 1;
    }

    /// Record an expression handed to its emitter.
    pub fn record_expression_lowered(&self, op_type: &str) {
        let name = self.intern_str(op_type);
        self.lowered_trace.borrow_mut().push(name);
        self.stats.borrow_mut().expressions_lowered += 1;
    }

    /// Record physical registers mapped for general purpose and vector classes.
    pub fn record_registers_mapped(&self, gpr: usize, vec: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.gpr_mapped += gpr;
        stats.vec_mapped += vec;
    }

    pub fn record_buffers_allocated(&self, count: usize, scratchpad_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.buffers_allocated += count;
        stats.scratchpad_size = stats.scratchpad_size.max(scratchpad_size);
    }

    /// Record that a snippet was compiled.
    pub fn record_snippet_compiled(&self, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.snippets_compiled += 1;
        stats.total_code_size += code_size;
        let name = self.current_snippet.borrow().clone().unwrap_or_default();
        if stats.largest_snippet_size < code_size {
            stats.largest_snippet_size = code_size;
            stats.largest_snippet_name = name;
        }
    }

    /// Op type names of the last lowered snippet, in emission order.
    pub fn lowered_trace(&self) -> Vec<&'arena str> {
        self.lowered_trace.borrow().clone()
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of snippets compiled.
    pub snippets_compiled: usize,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    pub largest_snippet_size: usize,
    pub largest_snippet_name: String,

    /// Runs per pass name.
    pub pass_runs: HashMap<String, usize>,

    /// Pass runs that changed the IR.
    pub passes_modified: usize,

    pub loops_split: usize,
    pub clones_created: usize,
    pub loops_evaluated_once: usize,

    pub expressions_lowered: usize,

    pub gpr_mapped: usize,
    pub vec_mapped: usize,

    pub buffers_allocated: usize,

    /// Largest scratchpad required by a snippet of this session (bytes).
    pub scratchpad_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Snippets compiled: {}", self.snippets_compiled)?;
        writeln!(f, "  Expressions lowered: {}", self.expressions_lowered)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Loops split: {} ({} clones)", self.loops_split, self.clones_created)?;
        writeln!(f, "  Loops evaluated once: {}", self.loops_evaluated_once)?;
        writeln!(f, "  Registers mapped: {} gpr, {} vec", self.gpr_mapped, self.vec_mapped)?;
        writeln!(
            f,
            "  Buffers allocated: {} (scratchpad {} bytes)",
            self.buffers_allocated, self.scratchpad_size
        )?;

        if !self.largest_snippet_name.is_empty() {
            writeln!(
                f,
                "  Largest snippet: {} ({} bytes)",
                self.largest_snippet_name, self.largest_snippet_size
            )?;
        }

        if !self.pass_runs.is_empty() {
            writeln!(f, "  Pass runs ({} modified the IR):", self.passes_modified)?;
            let mut sorted: Vec<_> = self.pass_runs.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (name, count) in sorted.into_iter().take(16) {
                writeln!(f, "    {}: {}", name, count)?;
            }
        }

        Ok(())
    }
}
