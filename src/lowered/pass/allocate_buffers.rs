// This module assigns scratchpad offsets to buffers. Buffers are visited in program order against a
// running high-water mark. An intermediate buffer written by an elementwise loop may reuse the
// region of the buffer allocated just before it when that loop is the last reader of the previous
// buffer and the region is large enough: the loop reads and writes each element at the same index,
// so working in place is safe. Transpose loops, brgemm producers and new-memory buffers always get a
// fresh region. Once fixed, the offset is written into the memory access descriptor of every
// operation that reads or writes the buffer.

//! Scratchpad offset assignment with in-place reuse.

use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, OutputRef};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::{Pass, PassId};
use crate::lowered::types::{BufferKind, OpKind};

pub struct AllocateBuffers;

/// Innermost loop of the Store producing `buffer`, when the buffer is written by an elementwise loop.
fn producer_loop(ir: &LinearIR, buffer: ExprId) -> CompileResult<Option<usize>> {
    let Some(input) = ir.expr(buffer)?.inputs.first() else {
        return Ok(None);
    };
    let producer = ir.expr(input.source.expr)?;
    match producer.kind {
        OpKind::Store(_) => Ok(producer.innermost_loop()),
        _ => Ok(None),
    }
}

fn loop_has_reshape(ir: &LinearIR, loop_id: usize) -> bool {
    ir.iter()
        .any(|(_, e)| e.loop_ids.contains(&loop_id) && matches!(e.kind, OpKind::LoadReshape { .. }))
}

fn buffer_size(ir: &LinearIR, buffer: ExprId) -> CompileResult<usize> {
    match &ir.expr(buffer)?.kind {
        OpKind::Buffer(data) => Ok(data.byte_size),
        other => Err(CompileError::structural(format!("expected a Buffer, found {}", other.op_type()))),
    }
}

/// Whether every reader of `buffer` sits inside `loop_id`.
fn last_read_in_loop(ir: &LinearIR, buffer: ExprId, loop_id: usize) -> CompileResult<bool> {
    for (consumer, _) in ir.consumers(OutputRef::new(buffer, 0)) {
        let expr = ir.expr(consumer)?;
        if expr.is_loop_marker() {
            continue;
        }
        if !expr.loop_ids.contains(&loop_id) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Write `offset` into every memory access touching `buffer`.
fn propagate_offset(ir: &mut LinearIR, buffer: ExprId, offset: usize) -> CompileResult<()> {
    let producer = ir.expr(buffer)?.inputs.first().map(|input| input.source);
    if let Some(source) = producer {
        let expr = ir.expr_mut(source.expr)?;
        let op_type = expr.op_type();
        match expr.kind.output_access_mut(source.index) {
            Some(access) => access.offset = offset,
            None => {
                return Err(CompileError::structural(format!(
                    "buffer {} is produced by {op_type} which has no memory access",
                    buffer.0
                )))
            }
        }
    }
    for (consumer, index) in ir.consumers(OutputRef::new(buffer, 0)) {
        let expr = ir.expr_mut(consumer)?;
        if expr.is_loop_marker() {
            continue;
        }
        let op_type = expr.op_type();
        match expr.kind.input_access_mut(index) {
            Some(access) => access.offset = offset,
            None => {
                return Err(CompileError::structural(format!(
                    "buffer {} is consumed by {op_type} which has no memory access",
                    buffer.0
                )))
            }
        }
    }
    Ok(())
}

impl Pass for AllocateBuffers {
    fn id(&self) -> PassId {
        PassId::AllocateBuffers
    }

    fn run(&mut self, ir: &mut LinearIR, session: &CompilationSession<'_>) -> CompileResult<bool> {
        let buffers = ir.buffers();
        let mut scratchpad_size = 0usize;
        let mut current_offset = 0usize;
        let mut previous: Option<ExprId> = None;

        for &buffer in &buffers {
            let byte_size = buffer_size(ir, buffer)?;
            let kind = match &ir.expr(buffer)?.kind {
                OpKind::Buffer(data) => data.kind,
                _ => BufferKind::NewMemory,
            };
            if kind == BufferKind::IntermediateMemory && ir.expr(buffer)?.inputs.len() != 1 {
                return Err(CompileError::structural(format!(
                    "intermediate buffer {} must have exactly one producer",
                    buffer.0
                )));
            }

            let reuse = match (previous, kind) {
                (Some(prev), BufferKind::IntermediateMemory) => match producer_loop(ir, buffer)? {
                    Some(loop_id) => {
                        !loop_has_reshape(ir, loop_id)
                            && last_read_in_loop(ir, prev, loop_id)?
                            && buffer_size(ir, prev)? >= byte_size
                            && scratchpad_size - current_offset >= byte_size
                    }
                    None => false,
                },
                _ => false,
            };

            let offset = if reuse {
                current_offset
            } else {
                current_offset = scratchpad_size;
                scratchpad_size += byte_size;
                current_offset
            };
            if let OpKind::Buffer(data) = &mut ir.expr_mut(buffer)?.kind {
                data.offset = Some(offset);
            }
            propagate_offset(ir, buffer, offset)?;
            log::debug!(
                "buffer {} ({byte_size} bytes): offset {offset}{}",
                buffer.0,
                if reuse { " (reused)" } else { "" }
            );
            previous = Some(buffer);
        }

        ir.set_scratchpad_size(scratchpad_size);
        session.record_buffers_allocated(buffers.len(), scratchpad_size);
        Ok(!buffers.is_empty())
    }
}
