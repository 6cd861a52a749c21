use bumpalo::Bump;
use snippets::core::{CompilationSession, CompileError, Config, ErrorCategory};
use snippets::lowered::pass::PassId;
use snippets::lowered::ElementType;
use snippets::subgraph::{BlockedShape, Subgraph, SubgraphBuilder};
use snippets::x64::{BrgemmKernelDesc, X64CompileParams, X64TargetMachine};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn planar(shape: &[usize]) -> BlockedShape {
    BlockedShape::planar(shape.to_vec(), ElementType::F32)
}

fn mul_add(shape: &[usize]) -> Subgraph {
    let mut b = SubgraphBuilder::new();
    let x = b.parameter(ElementType::F32, shape.to_vec());
    let y = b.parameter(ElementType::F32, shape.to_vec());
    let z = b.parameter(ElementType::F32, shape.to_vec());
    let prod = b.multiply(x, y).unwrap();
    let sum = b.add(prod, z).unwrap();
    b.result(sum).unwrap();
    b.build().unwrap()
}

fn matmul(m: usize, k: usize, n: usize, relu: bool) -> Subgraph {
    let mut b = SubgraphBuilder::new();
    let a = b.parameter(ElementType::F32, vec![1, m, k]);
    let w = b.parameter(ElementType::F32, vec![1, k, n]);
    let mut out = b.matmul(a, w).unwrap();
    if relu {
        out = b.relu(out).unwrap();
    }
    b.result(out).unwrap();
    b.build().unwrap()
}

#[test]
fn eltwise_kernel_end_to_end() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();

    let shape = [2, 4, 20];
    let schedule = mul_add(&shape)
        .with_name("mul_add")
        .generate(&[planar(&shape)], &[planar(&shape), planar(&shape), planar(&shape)], &mut target, &session, None)
        .unwrap();

    assert_eq!(schedule.work_size, vec![2, 1, 1]);
    assert!(schedule.is_flat);
    assert_eq!(schedule.code.scratchpad_size(), 0);
    assert_eq!(schedule.code.abi().num_args(), 5);
    // push rbx opens the prologue.
    assert_eq!(schedule.code.as_bytes()[0], 0x53);

    let trace = session.lowered_trace();
    assert!(trace.contains(&"Fma"));
    assert!(!trace.contains(&"Multiply"));

    let stats = session.stats();
    assert_eq!(stats.snippets_compiled, 1);
    assert_eq!(stats.total_code_size, schedule.code.size());
    assert_eq!(stats.largest_snippet_name, "mul_add");
    for pass in ["MulAddToFma", "MarkLoops", "InsertLoops", "AssignRegisters", "InsertSpecificIterations"] {
        assert!(stats.pass_runs.contains_key(pass), "{pass} did not run");
    }
    assert!(stats.loops_split >= 1);
}

#[test]
fn disabled_fusion_keeps_multiply() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();

    let shape = [8, 16];
    let mut graph = mul_add(&shape).with_config(Config::default().disable_pass(PassId::MulAddToFma));
    graph
        .generate(&[planar(&shape)], &[planar(&shape), planar(&shape), planar(&shape)], &mut target, &session, None)
        .unwrap();

    let trace = session.lowered_trace();
    assert!(trace.contains(&"Multiply"));
    assert!(!trace.contains(&"Fma"));
    assert!(!session.stats().pass_runs.contains_key("MulAddToFma"));
}

#[test]
fn scalar_and_precision_conversion() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();

    let mut b = SubgraphBuilder::new();
    let x = b.parameter(ElementType::F32, vec![3, 37]);
    let two = b.scalar(2.0);
    let scaled = b.multiply(x, two).unwrap();
    b.result(scaled).unwrap();
    let mut graph = b.build().unwrap();

    let io = BlockedShape::planar(vec![3, 37], ElementType::I32);
    let schedule = graph.generate(&[io.clone()], &[io], &mut target, &session, None).unwrap();
    assert_eq!(schedule.work_size, vec![1, 1]);

    let trace = session.lowered_trace();
    assert!(trace.contains(&"Scalar"));
    assert!(trace.iter().filter(|&&op| op == "Convert").count() >= 2);
}

#[test]
fn brgemm_without_resolver_is_a_target_error() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();

    let err = matmul(32, 16, 64, false)
        .generate(&[planar(&[1, 32, 64])], &[planar(&[1, 32, 16]), planar(&[1, 16, 64])], &mut target, &session, None)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::TargetCapability);
    assert!(err.is_fusion_rejection());
}

#[test]
fn brgemm_calls_resolved_kernel() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();

    let seen: Rc<RefCell<Vec<BrgemmKernelDesc>>> = Rc::default();
    let record = Rc::clone(&seen);
    let params = X64CompileParams::new().with_brgemm_resolver(move |desc| {
        record.borrow_mut().push(*desc);
        Some(0x1000)
    });

    let schedule = matmul(32, 16, 64, false)
        .generate(
            &[planar(&[1, 32, 64])],
            &[planar(&[1, 32, 16]), planar(&[1, 16, 64])],
            &mut target,
            &session,
            Some(&params as &dyn Any),
        )
        .unwrap();

    assert_eq!(schedule.work_size, vec![1, 1, 1]);
    assert_eq!(schedule.code.scratchpad_size(), 0);
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    let desc = seen[0];
    assert_eq!((desc.m, desc.n, desc.k), (32, 64, 16));
    assert_eq!((desc.lda, desc.ldb, desc.ldc), (16, 64, 64));
    assert_eq!(desc.beta, 0.0);
}

#[test]
fn brgemm_output_feeding_eltwise_uses_scratchpad() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();
    let params = X64CompileParams::new().with_brgemm_resolver(|_| Some(0x1000));

    let schedule = matmul(32, 16, 64, true)
        .generate(
            &[planar(&[1, 32, 64])],
            &[planar(&[1, 32, 16]), planar(&[1, 16, 64])],
            &mut target,
            &session,
            Some(&params as &dyn Any),
        )
        .unwrap();

    assert_eq!(schedule.code.scratchpad_size(), 32 * 64 * 4);
    assert_eq!(session.stats().buffers_allocated, 1);
}

#[test]
fn outer_transpose_is_rejected() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();

    let mut b = SubgraphBuilder::new();
    let x = b.parameter(ElementType::F32, vec![4, 2, 8, 16]);
    let t = b.transpose(x, vec![1, 0, 2, 3]).unwrap();
    let r = b.relu(t).unwrap();
    b.result(r).unwrap();
    let mut graph = b.build().unwrap();

    let err = graph
        .generate(&[planar(&[2, 4, 8, 16])], &[planar(&[4, 2, 8, 16])], &mut target, &session, None)
        .unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedLayout { .. }));
    assert!(err.is_fusion_rejection());
}

#[test]
fn host_target_reports_support() {
    let target = X64TargetMachine::new().unwrap();
    let session_arena = Bump::new();
    let session = CompilationSession::new(&session_arena);
    let shape = [4, 16];
    let mut target = target;
    let result = mul_add(&shape).generate(
        &[planar(&shape)],
        &[planar(&shape), planar(&shape), planar(&shape)],
        &mut target,
        &session,
        None,
    );
    match result {
        Ok(schedule) => assert!(schedule.code.size() > 0),
        Err(err) => assert_eq!(err.category(), ErrorCategory::TargetCapability),
    }
}

fn add_relu(shape: &[usize]) -> Subgraph {
    let mut b = SubgraphBuilder::new();
    let x = b.parameter(ElementType::F32, shape.to_vec());
    let y = b.parameter(ElementType::F32, shape.to_vec());
    let sum = b.add(x, y).unwrap();
    let out = b.relu(sum).unwrap();
    b.result(out).unwrap();
    b.build().unwrap()
}

#[test]
fn recompiling_is_deterministic() {
    init_logging();
    let shape = [2, 4, 37];
    let compile = |arena: &Bump| {
        let session = CompilationSession::new(arena);
        let mut target = X64TargetMachine::cross_compile().unwrap();
        let schedule = add_relu(&shape)
            .generate(&[planar(&shape)], &[planar(&shape), planar(&shape)], &mut target, &session, None)
            .unwrap();
        let trace: Vec<String> = session.lowered_trace().iter().map(|op| op.to_string()).collect();
        (schedule, trace)
    };

    let (first_arena, second_arena) = (Bump::new(), Bump::new());
    let (first, first_trace) = compile(&first_arena);
    let (second, second_trace) = compile(&second_arena);

    assert_eq!(first.work_size, second.work_size);
    assert_eq!(first.is_flat, second.is_flat);
    assert!(!first_trace.is_empty());
    assert_eq!(first_trace, second_trace);
    assert_eq!(first.code.as_bytes(), second.code.as_bytes());
}

#[test]
fn shared_operand_with_conflicting_strides_is_rejected() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();
    let params = X64CompileParams::new().with_brgemm_resolver(|_| Some(0x1000));

    // Blocking K walks the same pointer along rows for A and along columns for B.
    let mut b = SubgraphBuilder::new();
    let x = b.parameter(ElementType::F32, vec![1, 24, 24]);
    let square = b.matmul(x, x).unwrap();
    b.result(square).unwrap();
    let mut graph = b.build().unwrap().with_config(Config::default().with_brgemm_blocking(64, 64, 16));

    let err = graph
        .generate(&[planar(&[1, 24, 24])], &[planar(&[1, 24, 24])], &mut target, &session, Some(&params as &dyn Any))
        .unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedLayout { .. }));
    assert!(err.is_fusion_rejection());
}
