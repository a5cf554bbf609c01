//! Integration tests for the patch layer.
//!
//! Modules are loaded from a temporary install directory, patched through the public pipeline,
//! written, and loaded back.

mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use common::{method, Install, MOVE_NEXT_LEN, REAL};
use dotpatch::{
    assembly::DecodedInstruction,
    metadata::{
        signatures::{MethodSignature, TypeSig},
        tables::{MemberRefRaw, TableId},
    },
    prelude::*,
};

/// The `mscorlib` reference of the game fixture
fn mscorlib() -> Token {
    Token::from_parts(TableId::AssemblyRef, 1)
}

/// Name and parameter count of the method a `call` targets
fn callee(module: &Module, instruction: &DecodedInstruction) -> (String, usize) {
    let Operand::Token(token) = instruction.operand else {
        panic!("{} without token", instruction.opcode);
    };
    assert!(token.is_table(TableId::MemberRef));
    let meta = module.metadata();
    let row = MemberRefRaw::read(&meta.tables, token.row()).unwrap();
    let name = meta.strings.get(row.name as usize).unwrap().to_string();
    let signature = meta.method_signature(row.signature).unwrap();
    (name, signature.params.len())
}

/// Follow the instructions from `index` to the next `call`
fn call_reached_from(decoded: &[DecodedInstruction], mut index: usize) -> usize {
    loop {
        let instruction = &decoded[index];
        if instruction.opcode == OpCode::CALL {
            return index;
        }
        assert_ne!(instruction.opcode, OpCode::RET, "path returned before a call");
        index = match instruction.operand {
            Operand::Target(target) if instruction.opcode == OpCode::BR_S => decoded
                .iter()
                .position(|i| i.offset == target)
                .unwrap(),
            _ => index + 1,
        };
    }
}

#[test]
fn game_debug_log_paths() {
    let install = Install::new();
    let mut module = install.load();
    let log = method(&module, "GameDebug", "Log");

    let report = PatchPipeline::new()
        .add_patch(GameDebugLogPatch::default())
        .run_and_write(&mut module, &install.output())
        .unwrap();
    assert_eq!(report.patch_names(), ["GameDebug Log Implementation"]);

    let patched = ModuleLoader::new().load_file(&install.output()).unwrap();
    let committed = module.body(log).unwrap().code();
    assert!(patched.original_body(log).unwrap().ends_with(committed));
    let decoded = decode_stream(committed).unwrap();

    // args.Length feeds the conditional branch
    let branch = decoded
        .iter()
        .position(|i| i.opcode == OpCode::BRFALSE_S)
        .unwrap();
    assert_eq!(decoded[branch - 1].opcode, OpCode::LDLEN);
    assert_eq!(decoded[branch - 2].opcode, OpCode::LDARG_S);

    // Non-empty args fall through to the formatted call
    let formatted = call_reached_from(&decoded, branch + 1);
    assert_eq!(callee(&patched, &decoded[formatted]), ("LogFormat".to_string(), 3));
    let pushed: Vec<_> = decoded[branch + 1..formatted].iter().map(|i| i.opcode).collect();
    assert_eq!(pushed, [OpCode::LDARG_1, OpCode::LDARG_3, OpCode::LDARG_S]);

    // Empty args branch to the single-argument call
    let Operand::Target(target) = decoded[branch].operand else {
        panic!("branch without target");
    };
    let label = decoded.iter().position(|i| i.offset == target).unwrap();
    let single = call_reached_from(&decoded, label);
    assert_eq!(callee(&patched, &decoded[single]), ("Log".to_string(), 2));
    assert_eq!(decoded[label].opcode, OpCode::LDARG_3);
    assert_eq!(decoded[label + 1].opcode, OpCode::LDARG_1);
}

#[test]
fn store_guard_splices_into_purchase_flow() {
    let install = Install::new();
    let mut module = install.load();
    let move_next = method(&module, "StoreUI/<RunPurchaseFlow>c__Iterator81", "MoveNext");

    StorePurchasePatch::default().apply(&mut module).unwrap();

    let body = module.body(move_next).unwrap();
    // One branch replaced, four guard instructions inserted after it
    assert_eq!(body.instruction_count(), MOVE_NEXT_LEN + 4);

    let decoded = decode_stream(body.code()).unwrap();
    let guard = &decoded[0x48..0x4c];
    assert_eq!(guard[0].opcode, OpCode::LDARG_0);
    assert_eq!(guard[1].opcode, OpCode::LDFLD);
    // ldc.i4.<Real>
    assert_eq!(guard[2].opcode, OpCode::from_parts(0, 0x16 + REAL as u8).unwrap());
    assert_eq!(guard[3].opcode, OpCode::BEQ_S);

    // The real-money purchase is the second to last instruction, as before
    let real = &decoded[decoded.len() - 2];
    assert_eq!(real.opcode, OpCode::LDC_I4_1);
    assert_eq!(guard[3].operand, Operand::Target(real.offset));
}

#[test]
fn guard_patch_retargets_existing_branch() {
    // if (mode == 1) goto done; ... with the guard spliced in before the comparison region
    let mut builder = common::game_builder();
    let object = builder.type_ref(mscorlib(), "System", "Object");
    let ty = builder.type_def("Checks", "Gate", Some(object));
    #[rustfmt::skip]
    let code = [
        0x02,               // IL_0000: ldarg.0
        0x2D, 0x02,         // IL_0001: brtrue.s IL_0005
        0x16,               // IL_0003: ldc.i4.0
        0x2A,               // IL_0004: ret
        0x03,               // IL_0005: ldarg.1
        0x17,               // IL_0006: ldc.i4.1
        0x2E, 0x02,         // IL_0007: beq.s IL_000b
        0x16,               // IL_0009: ldc.i4.0
        0x2A,               // IL_000a: ret
        0x17,               // IL_000b: ldc.i4.1
        0x2A,               // IL_000c: ret
    ];
    builder.method(
        ty,
        "Allow",
        common::STATIC,
        &MethodSignature::new_static(TypeSig::Boolean, vec![TypeSig::Boolean, TypeSig::I4]),
        &code,
    );
    let install = Install::with_game(&builder);
    let mut module = install.load();
    let allow = method(&module, "Checks.Gate", "Allow");

    let patch = ConditionalGuardPatch::new(
        "Deny mode 7",
        "Checks.Gate",
        "Allow",
        GuardPosition::Before(Anchor::expecting(0x05, OpCode::LDARG_1)),
        ConditionalGuard::new(
            GuardSubject::Argument(1),
            GuardConstant::Literal(7),
            Comparison::Equal,
            Anchor::at(0x09),
        ),
    )
    .retarget_incoming(true);
    PatchPipeline::new()
        .add_patch(patch)
        .run_and_write(&mut module, &install.output())
        .unwrap();

    let body = module.body(allow).unwrap();
    assert_eq!(body.instruction_count(), 11 + 3);

    let decoded = decode_stream(body.code()).unwrap();
    assert_eq!(decoded[1].opcode, OpCode::BRTRUE_S);
    assert_eq!(decoded[1].operand, Operand::Target(decoded[4].offset));
    assert_eq!(decoded[4].opcode, OpCode::LDARG_1);
    assert_eq!(decoded[6].opcode, OpCode::BEQ_S);
    assert_eq!(decoded[6].operand, Operand::Target(decoded[10].offset));
    assert_eq!(decoded[10].opcode, OpCode::LDC_I4_0);
    // The original comparison still reaches its own target
    assert_eq!(decoded[9].opcode, OpCode::BEQ_S);
    assert_eq!(decoded[9].operand, Operand::Target(decoded[12].offset));

    let written = ModuleLoader::new().load_file(&install.output()).unwrap();
    let original = written.original_body(allow).unwrap();
    assert!(original.ends_with(body.code()));
}

#[test]
fn failed_patch_keeps_bodies_and_output() {
    let install = Install::new();
    let mut module = install.load();
    let move_next = method(&module, "StoreUI/<RunPurchaseFlow>c__Iterator81", "MoveNext");
    let request = method(&module, "StoreManager", "RequestPurchase");
    let before = (
        module.original_body(move_next).unwrap().to_vec(),
        module.original_body(request).unwrap().to_vec(),
    );

    // The first method is edited before the second anchor misses
    let patch = StorePurchasePatch {
        skip_platform_store: Anchor::at(0x36),
        ..StorePurchasePatch::default()
    };
    let result = PatchPipeline::new()
        .add_patch(patch)
        .run_and_write(&mut module, &install.output());

    match result {
        Err(Error::PatchFailed { patch, source }) => {
            assert_eq!(patch, "Fix Store For Devices Without GMS");
            assert!(matches!(*source, Error::AnchorNotFound { offset: 0x36, .. }));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(!module.is_modified());
    assert!(module.body(move_next).is_none());
    assert_eq!(module.original_body(move_next).unwrap(), before.0.as_slice());
    assert_eq!(module.original_body(request).unwrap(), before.1.as_slice());
    assert!(!install.output().exists());
}

struct Counted {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl Patch for Counted {
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, module: &mut Module) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            module.find_type("Missing.Type")?;
        }
        Ok(())
    }
}

#[test]
fn pipeline_short_circuits() {
    let install = Install::new();
    let mut module = install.load();
    let calls: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let mut pipeline = PatchPipeline::new();
    for (index, name) in ["one", "two", "three"].into_iter().enumerate() {
        pipeline.push(Box::new(Counted {
            name,
            calls: Arc::clone(&calls[index]),
            fail: index == 1,
        }));
    }
    assert_eq!(pipeline.len(), 3);

    let output = install.output();
    std::fs::write(&output, b"previous").unwrap();
    let error = pipeline.run_and_write(&mut module, &output).unwrap_err();

    assert!(error.to_string().contains("'two'"));
    assert!(error.to_string().contains("Missing.Type"));
    let counts: Vec<_> = calls.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(counts, [1, 1, 0]);
    assert_eq!(std::fs::read(&output).unwrap(), b"previous");
}

#[test]
fn resolution_is_deterministic() {
    let install = Install::new();
    let signature = common::log_signature();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let mut module = install.load();
        let ty = module.find_type("GameDebug").unwrap().token;
        let first = module.find_method(ty, "Log", &signature).unwrap().token;
        let second = module.find_method(ty, "Log", &signature).unwrap().token;
        assert_eq!(first, second);

        PatchPipeline::new()
            .add_patch(GameDebugLogPatch::default())
            .add_patch(StorePurchasePatch::default())
            .run(&mut module)
            .unwrap();
        assert_eq!(module.find_method(ty, "Log", &signature).unwrap().token, first);

        let bytes: Vec<_> = module
            .bodies()
            .values()
            .map(|body| body.bytes().to_vec())
            .collect();
        seen.push((first, ModuleWriter::new().to_vec(&module).unwrap(), bytes));
    }
    assert!(seen.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn exact_overload_law() {
    let mut builder = common::game_builder();
    let object = builder.type_ref(mscorlib(), "System", "Object");
    let ty = builder.type_def("Overloads", "Pair", Some(object));
    let int = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::String, TypeSig::I4]);
    let long = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::String, TypeSig::I8]);
    let with_int = builder.method(ty, "Emit", common::STATIC, &int, &[0x2A]);
    let with_long = builder.method(ty, "Emit", common::STATIC, &long, &[0x2A]);
    let install = Install::with_game(&builder);
    let module = install.load();

    let pair = module.find_type("Overloads.Pair").unwrap().token;
    assert_eq!(module.find_method(pair, "Emit", &int).unwrap().token, with_int);
    assert_eq!(module.find_method(pair, "Emit", &long).unwrap().token, with_long);
    assert!(matches!(
        module.find_method_by_name(pair, "Emit"),
        Err(Error::AmbiguousSymbol(_))
    ));

    let boolean = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::String, TypeSig::Boolean]);
    assert!(matches!(
        module.find_method(pair, "Emit", &boolean),
        Err(Error::SignatureMismatch { candidates: 2, .. })
    ));
}

#[test]
fn missing_engine_is_a_dependency_failure() {
    let install = Install::new();
    std::fs::remove_file(install.dir().join("UnityEngine.dll")).unwrap();
    let mut module = install.load();

    let error = PatchPipeline::new()
        .add_patch(GameDebugLogPatch::default())
        .run(&mut module)
        .unwrap_err();
    let Error::PatchFailed { source, .. } = error else {
        panic!("unexpected error {error:?}");
    };
    assert!(matches!(*source, Error::DependencyNotFound(_)));
}

#[test]
fn patcher_with_search_dir() {
    let install = Install::new();
    let managed = tempfile::tempdir().unwrap();
    std::fs::rename(
        install.dir().join("UnityEngine.dll"),
        managed.path().join("UnityEngine.dll"),
    )
    .unwrap();

    let report = Patcher::new(
        PatchPipeline::new()
            .add_patch(GameDebugLogPatch::default())
            .add_patch(StorePurchasePatch::default()),
    )
    .search_dir(managed.path())
    .patch_file(&install.game(), &install.game())
    .unwrap();

    assert_eq!(report.applied.len(), 2);
    let patched = ModuleLoader::new()
        .search_dir(managed.path())
        .load_file(&install.game())
        .unwrap();
    assert!(patched.file().sections().len() > 1);
    assert!(patched
        .assembly_refs()
        .iter()
        .any(|reference| reference.identity.name == "UnityEngine"));
}
