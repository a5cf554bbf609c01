//! Shared fixtures: a small engine assembly and a game assembly shaped like the Unity client
//! the bundled patches target.

use std::sync::Arc;

use crate::{
    builder::AssemblyBuilder,
    metadata::{
        constant::ConstantValue,
        signatures::{MethodSignature, TypeSig},
        token::Token,
    },
    module::{AssemblyResolver, Module},
};

const STATIC_METHOD: u32 = 0x0096;
const INSTANCE_METHOD: u32 = 0x0086;
const ENUM_VALUE_FIELD: u32 = 0x0606;
const ENUM_MEMBER_FIELD: u32 = 0x8056;
const ASSEMBLY_FIELD: u32 = 0x0003;

/// `StoreManager/StoreCurrencyType::Real` in the fixture
pub const REAL_CURRENCY: i32 = 2;
/// Instructions in the fixture `MoveNext`
pub const MOVE_NEXT_INSTRUCTIONS: usize = 92;
/// Instructions in the fixture `RequestPurchase`
pub const REQUEST_PURCHASE_INSTRUCTIONS: usize = 54;

fn nops(count: usize) -> Vec<u8> {
    vec![0x00; count]
}

/// `<RunPurchaseFlow>c__Iterator81::MoveNext`, with the purchase branch at 0x47, the next
/// comparison at 0x4c and the real purchase at 0x5b
pub fn move_next_code() -> Vec<u8> {
    let mut code = nops(0x46);
    #[rustfmt::skip]
    let branch = [
        0x02,               // 0x46 ldarg.0
        0x2C, 0x12,         // 0x47 brfalse.s 0x5b
        0x00, 0x00, 0x00,   // 0x49 nop x3
        0x16,               // 0x4c ldc.i4.0
        0x2A,               // 0x4d ret
    ];
    code.extend_from_slice(&branch);
    code.extend(nops(0x5b - 0x4e));
    #[rustfmt::skip]
    let purchase = [
        0x17,               // 0x5b ldc.i4.1
        0x2A,               // 0x5c ret
    ];
    code.extend_from_slice(&purchase);
    code
}

/// `StoreManager::RequestPurchase`, a run of `nop`s with the insertion anchor at 0x11 and
/// `ret` at 0x35
pub fn request_purchase_code() -> Vec<u8> {
    let mut code = nops(0x35);
    code.push(0x2A);
    code
}

fn engine_builder() -> AssemblyBuilder {
    let mut builder = AssemblyBuilder::new("UnityEngine");
    let mscorlib = builder.assembly_ref("mscorlib", [2, 0, 0, 0]);
    let system_object = builder.type_ref(mscorlib, "System", "Object");

    builder.type_def("UnityEngine", "Object", Some(system_object));
    let debug = builder.type_def("UnityEngine", "Debug", Some(system_object));

    let object = TypeSig::class("UnityEngine.Object");
    let args = TypeSig::sz_array(TypeSig::Object);
    builder.method(
        debug,
        "Log",
        STATIC_METHOD,
        &MethodSignature::new_static(TypeSig::Void, vec![TypeSig::Object]),
        &[],
    );
    builder.method(
        debug,
        "Log",
        STATIC_METHOD,
        &MethodSignature::new_static(TypeSig::Void, vec![TypeSig::Object, object.clone()]),
        &[],
    );
    builder.method(
        debug,
        "LogFormat",
        STATIC_METHOD,
        &MethodSignature::new_static(TypeSig::Void, vec![TypeSig::String, args.clone()]),
        &[],
    );
    builder.method(
        debug,
        "LogFormat",
        STATIC_METHOD,
        &MethodSignature::new_static(TypeSig::Void, vec![object, TypeSig::String, args]),
        &[],
    );
    builder
}

/// The `UnityEngine` image with `Object` and the `Debug::Log`/`LogFormat` overloads
pub fn unity_engine() -> Vec<u8> {
    engine_builder().build().unwrap()
}

fn enum_type(
    builder: &mut AssemblyBuilder,
    name: &str,
    base: Token,
    members: &[(&str, i32)],
    outer: Option<Token>,
) -> Token {
    let ty = builder.type_def("", name, Some(base));
    if let Some(outer) = outer {
        builder.nested_class(ty, outer);
    }
    builder.field(ty, "value__", ENUM_VALUE_FIELD, &TypeSig::I4, None);
    for (member, value) in members {
        builder.field(ty, member, ENUM_MEMBER_FIELD, &TypeSig::I4, Some(ConstantValue::I4(*value)));
    }
    ty
}

/// The `Assembly-CSharp` builder with the types the bundled patches look up
pub fn game_builder() -> AssemblyBuilder {
    let mut builder = AssemblyBuilder::new("Assembly-CSharp");
    let mscorlib = builder.assembly_ref("mscorlib", [2, 0, 0, 0]);
    let unity = builder.assembly_ref("UnityEngine", [0, 0, 0, 0]);
    let system_object = builder.type_ref(mscorlib, "System", "Object");
    let system_enum = builder.type_ref(mscorlib, "System", "Enum");
    builder.type_ref(unity, "UnityEngine", "Object");

    enum_type(&mut builder, "LogGroup", system_enum, &[("General", 0), ("Store", 1)], None);
    enum_type(&mut builder, "LogLevel", system_enum, &[("Info", 0), ("Error", 1)], None);

    let game_debug = builder.type_def("", "GameDebug", Some(system_object));
    let log = builder.method(
        game_debug,
        "Log",
        STATIC_METHOD,
        &MethodSignature::new_static(
            TypeSig::Void,
            vec![
                TypeSig::value_type("LogGroup"),
                TypeSig::class("UnityEngine.Object"),
                TypeSig::value_type("LogLevel"),
                TypeSig::String,
                TypeSig::sz_array(TypeSig::Object),
            ],
        ),
        &[0x00, 0x2A],
    );
    builder.param_names(log, &["group", "context", "level", "format", "args"]);
    builder.method(
        game_debug,
        "Log",
        STATIC_METHOD,
        &MethodSignature::new_static(
            TypeSig::Void,
            vec![TypeSig::value_type("LogGroup"), TypeSig::String],
        ),
        &[0x2A],
    );

    let store_manager = builder.type_def("", "StoreManager", Some(system_object));
    let request = builder.method(
        store_manager,
        "RequestPurchase",
        INSTANCE_METHOD,
        &MethodSignature::new_instance(
            TypeSig::Void,
            vec![
                TypeSig::String,
                TypeSig::value_type("StoreManager/StoreCurrencyType"),
            ],
        ),
        &request_purchase_code(),
    );
    builder.param_names(request, &["productId", "currency"]);
    enum_type(
        &mut builder,
        "StoreCurrencyType",
        system_enum,
        &[("Virtual", 0), ("Real", REAL_CURRENCY)],
        Some(store_manager),
    );

    let store_ui = builder.type_def("", "StoreUI", Some(system_object));
    let iterator = builder.type_def("", "<RunPurchaseFlow>c__Iterator81", Some(system_object));
    builder.nested_class(iterator, store_ui);
    builder.field(
        iterator,
        "currency",
        ASSEMBLY_FIELD,
        &TypeSig::value_type("StoreManager/StoreCurrencyType"),
        None,
    );
    builder.field(iterator, "$PC", ASSEMBLY_FIELD, &TypeSig::I4, None);
    builder.method(
        iterator,
        "MoveNext",
        INSTANCE_METHOD,
        &MethodSignature::new_instance(TypeSig::Boolean, Vec::new()),
        &move_next_code(),
    );

    builder.type_def("", "Product", Some(system_object));
    builder
}

/// A resolver that already holds the fixture engine
pub fn engine_resolver() -> Arc<AssemblyResolver> {
    let resolver = AssemblyResolver::default();
    resolver.insert(Module::from_bytes("UnityEngine.dll", unity_engine()).unwrap());
    Arc::new(resolver)
}

/// The fixture game module, resolving `UnityEngine` to the fixture engine
pub fn game_module() -> Module {
    Module::from_bytes_with(
        "Assembly-CSharp.dll",
        game_builder().build().unwrap(),
        engine_resolver(),
    )
    .unwrap()
}
