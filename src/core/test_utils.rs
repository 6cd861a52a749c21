//! Test utilities: arena-backed sessions and a recording Target Machine.
//!
//! Pass and driver tests build a [`test::TestContext`] per test so every
//! compilation session owns a bounded arena that is freed at the end of the
//! test. [`test::RecordingTarget`] emits one text line per expression instead of
//! machine code, which lets driver tests check the emission order and the
//! physical registers chosen for each operation.

#[cfg(test)]
pub mod test {
    use super::super::error::CompileResult;
    use super::super::register_file::{AsmReg, PhysRegInfo, RegisterBanks};
    use super::super::session::CompilationSession;
    use crate::generator::target::{Emitter, EmitterRegistry, KernelInfo, LoweringContext, OpType, TargetMachine};
    use crate::generator::CodePtr;
    use bumpalo::Bump;

    /// Owns the arena of the sessions a test creates.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        /// The session borrows the context, which must outlive it.
        pub fn create_session(&self) -> CompilationSession<'_> {
            CompilationSession::new(&self.arena)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    struct Recorder {
        op: OpType,
    }

    impl Emitter<Vec<String>> for Recorder {
        fn emit_code(&self, host: &mut Vec<String>, regs: &PhysRegInfo) -> CompileResult<()> {
            let ids = |regs: &[AsmReg]| {
                regs.iter().map(|r| r.id.to_string()).collect::<Vec<_>>().join(",")
            };
            host.push(format!("{} [{}] -> [{}]", self.op, ids(&regs.inputs), ids(&regs.outputs)));
            Ok(())
        }
    }

    struct RecordingKernel {
        info: KernelInfo,
        body: Vec<(Box<dyn Emitter<Vec<String>>>, PhysRegInfo)>,
    }

    impl Emitter<Vec<String>> for RecordingKernel {
        fn emit_code(&self, host: &mut Vec<String>, _regs: &PhysRegInfo) -> CompileResult<()> {
            host.push(format!(
                "Kernel {} in, {} out, {} buffers",
                self.info.num_inputs, self.info.num_outputs, self.info.num_buffer_ids
            ));
            for (emitter, regs) in &self.body {
                emitter.emit_code(host, regs)?;
            }
            Ok(())
        }
    }

    fn record_factory(ctx: &LoweringContext<'_>) -> CompileResult<Box<dyn Emitter<Vec<String>>>> {
        Ok(Box::new(Recorder { op: ctx.expr.op_type() }))
    }

    fn record_kernel(
        info: &KernelInfo,
        body: Vec<(Box<dyn Emitter<Vec<String>>>, PhysRegInfo)>,
    ) -> CompileResult<Box<dyn Emitter<Vec<String>>>> {
        Ok(Box::new(RecordingKernel { info: info.clone(), body }))
    }

    /// Target Machine whose "code" is a listing of the emitted operations.
    pub struct RecordingTarget {
        registry: EmitterRegistry<Vec<String>>,
        lines: Vec<String>,
        lanes: usize,
        gprs: u8,
        max_data_pointers: usize,
    }

    impl RecordingTarget {
        pub fn new(lanes: usize) -> Self {
            let mut registry = EmitterRegistry::new();
            for op in OpType::ALL {
                registry.register(op, record_factory);
            }
            registry.register_kernel(record_kernel);
            Self { registry, lines: Vec::new(), lanes, gprs: 16, max_data_pointers: 12 }
        }

        pub fn with_gpr_count(mut self, gprs: u8) -> Self {
            self.gprs = gprs;
            self
        }

        pub fn with_max_data_pointers(mut self, max: usize) -> Self {
            self.max_data_pointers = max;
            self
        }

        /// Listing of the last generated kernel.
        pub fn listing(&self) -> &[String] {
            &self.lines
        }
    }

    impl TargetMachine for RecordingTarget {
        type Host = Vec<String>;

        fn is_supported(&self) -> bool {
            true
        }

        fn get_lanes(&self) -> usize {
            self.lanes
        }

        fn registry(&self) -> &EmitterRegistry<Vec<String>> {
            &self.registry
        }

        fn register_banks(&self) -> RegisterBanks {
            RegisterBanks { gpr: (0..self.gprs).collect(), vec: (0..16).collect(), abi_params: vec![0, 1] }
        }

        fn max_data_pointers(&self) -> usize {
            self.max_data_pointers
        }

        fn host(&mut self) -> &mut Vec<String> {
            &mut self.lines
        }

        fn get_snippet(&mut self) -> CompileResult<CodePtr> {
            let text = self.lines.join("\n");
            Ok(CodePtr::new(text.into_bytes(), 0))
        }
    }
}
