use bumpalo::Bump;
use object::{Object, ObjectSection, ObjectSymbol};
use snippets::core::CompilationSession;
use snippets::lowered::ElementType;
use snippets::subgraph::{BlockedShape, SubgraphBuilder};
use snippets::x64::X64TargetMachine;

#[test]
fn kernel_object_exports_symbol() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut target = X64TargetMachine::cross_compile().unwrap();

    let mut b = SubgraphBuilder::new();
    let x = b.parameter(ElementType::F32, vec![5, 19]);
    let r = b.relu(x).unwrap();
    let n = b.negative(r).unwrap();
    b.result(n).unwrap();
    let mut graph = b.build().unwrap();

    let shape = BlockedShape::planar(vec![5, 19], ElementType::F32);
    let schedule = graph.generate(&[shape.clone()], &[shape], &mut target, &session, None).unwrap();

    let bytes = schedule.code.to_object("relu_neg_kernel").unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.architecture(), object::Architecture::X86_64);

    let text = file.section_by_name(".text").unwrap();
    assert_eq!(text.size(), schedule.code.size() as u64);
    assert_eq!(text.data().unwrap(), schedule.code.as_bytes());

    let symbol = file.symbol_by_name("relu_neg_kernel").unwrap();
    assert_eq!(symbol.kind(), object::SymbolKind::Text);
    assert_eq!(symbol.address(), 0);
}
