//! Fixtures shared by the integration tests.
//!
//! [`Install`] lays out a `Managed` directory the way a Unity player ships it: the game assembly
//! next to the engine assembly it references, both produced by the builder.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use dotpatch::{
    builder::AssemblyBuilder,
    metadata::{
        constant::ConstantValue,
        signatures::{MethodSignature, TypeSig},
    },
    prelude::*,
};
use tempfile::TempDir;

pub const STATIC: u32 = 0x0096;
pub const INSTANCE: u32 = 0x0086;
const ENUM_VALUE: u32 = 0x0606;
const ENUM_MEMBER: u32 = 0x8056;

/// `StoreManager/StoreCurrencyType::Real`
pub const REAL: i32 = 2;

/// Instruction count of the `MoveNext` fixture
pub const MOVE_NEXT_LEN: usize = 92;

pub fn engine() -> Vec<u8> {
    let mut builder = AssemblyBuilder::new("UnityEngine");
    let mscorlib = builder.assembly_ref("mscorlib", [2, 0, 0, 0]);
    let object = builder.type_ref(mscorlib, "System", "Object");
    builder.type_def("UnityEngine", "Object", Some(object));
    let debug = builder.type_def("UnityEngine", "Debug", Some(object));

    let engine_object = TypeSig::class("UnityEngine.Object");
    let args = TypeSig::sz_array(TypeSig::Object);
    let overloads = [
        ("Log", vec![TypeSig::Object]),
        ("Log", vec![TypeSig::Object, engine_object.clone()]),
        ("LogFormat", vec![TypeSig::String, args.clone()]),
        ("LogFormat", vec![engine_object, TypeSig::String, args]),
    ];
    for (name, params) in overloads {
        builder.method(
            debug,
            name,
            STATIC,
            &MethodSignature::new_static(TypeSig::Void, params),
            &[],
        );
    }
    builder.build().unwrap()
}

fn enum_type(
    builder: &mut AssemblyBuilder,
    system_enum: Token,
    name: &str,
    members: &[(&str, i32)],
) -> Token {
    let ty = builder.type_def("", name, Some(system_enum));
    builder.field(ty, "value__", ENUM_VALUE, &TypeSig::I4, None);
    for (member, value) in members {
        builder.field(ty, member, ENUM_MEMBER, &TypeSig::I4, Some(ConstantValue::I4(*value)));
    }
    ty
}

/// `MoveNext` of the purchase coroutine: `ldarg.0; brfalse.s` at 0x46, the next comparison at
/// 0x4c and the real-money purchase at 0x5b, padded with `nop`s
pub fn move_next() -> Vec<u8> {
    let mut code = vec![0x00; 0x46];
    #[rustfmt::skip]
    let region = [
        0x02,               // ldarg.0
        0x2C, 0x12,         // brfalse.s IL_005b
        0x00, 0x00, 0x00,   // nop
        0x16,               // IL_004c: ldc.i4.0
        0x2A,               // ret
    ];
    code.extend_from_slice(&region);
    code.resize(0x5b, 0x00);
    code.extend_from_slice(&[0x17, 0x2A]);
    code
}

/// `Assembly-CSharp` with every type the bundled patches touch
pub fn game_builder() -> AssemblyBuilder {
    let mut builder = AssemblyBuilder::new("Assembly-CSharp");
    let mscorlib = builder.assembly_ref("mscorlib", [2, 0, 0, 0]);
    let unity = builder.assembly_ref("UnityEngine", [0, 0, 0, 0]);
    let object = builder.type_ref(mscorlib, "System", "Object");
    let system_enum = builder.type_ref(mscorlib, "System", "Enum");
    builder.type_ref(unity, "UnityEngine", "Object");

    enum_type(&mut builder, system_enum, "LogGroup", &[("General", 0)]);
    enum_type(&mut builder, system_enum, "LogLevel", &[("Info", 0), ("Warning", 1)]);

    let game_debug = builder.type_def("", "GameDebug", Some(object));
    let log = builder.method(
        game_debug,
        "Log",
        STATIC,
        &log_signature(),
        &[0x2A],
    );
    builder.param_names(log, &["group", "context", "level", "format", "args"]);

    let store_manager = builder.type_def("", "StoreManager", Some(object));
    let currency = TypeSig::value_type("StoreManager/StoreCurrencyType");
    let request = builder.method(
        store_manager,
        "RequestPurchase",
        INSTANCE,
        &MethodSignature::new_instance(TypeSig::Void, vec![TypeSig::String, currency.clone()]),
        &{
            let mut code = vec![0x00; 0x35];
            code.push(0x2A);
            code
        },
    );
    builder.param_names(request, &["productId", "currency"]);
    let currency_type = enum_type(
        &mut builder,
        system_enum,
        "StoreCurrencyType",
        &[("Virtual", 0), ("Real", REAL)],
    );
    builder.nested_class(currency_type, store_manager);

    let store_ui = builder.type_def("", "StoreUI", Some(object));
    let flow = builder.type_def("", "<RunPurchaseFlow>c__Iterator81", Some(object));
    builder.nested_class(flow, store_ui);
    builder.field(flow, "currency", 0x0003, &currency, None);
    builder.method(
        flow,
        "MoveNext",
        INSTANCE,
        &MethodSignature::new_instance(TypeSig::Boolean, Vec::new()),
        &move_next(),
    );

    builder.type_def("", "Product", Some(object));
    builder
}

/// `GameDebug::Log(LogGroup, UnityEngine.Object, LogLevel, string, object[])`
pub fn log_signature() -> MethodSignature {
    MethodSignature::new_static(
        TypeSig::Void,
        vec![
            TypeSig::value_type("LogGroup"),
            TypeSig::class("UnityEngine.Object"),
            TypeSig::value_type("LogLevel"),
            TypeSig::String,
            TypeSig::sz_array(TypeSig::Object),
        ],
    )
}

/// A temporary `Managed` directory holding `Assembly-CSharp.dll` and `UnityEngine.dll`
pub struct Install {
    dir: TempDir,
}

impl Install {
    pub fn new() -> Self {
        Install::with_game(&game_builder())
    }

    pub fn with_game(game: &AssemblyBuilder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UnityEngine.dll"), engine()).unwrap();
        std::fs::write(dir.path().join("Assembly-CSharp.dll"), game.build().unwrap()).unwrap();
        Install { dir }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn game(&self) -> PathBuf {
        self.dir.path().join("Assembly-CSharp.dll")
    }

    pub fn output(&self) -> PathBuf {
        self.dir.path().join("Assembly-CSharp.patched.dll")
    }

    pub fn load(&self) -> Module {
        ModuleLoader::new().load_file(&self.game()).unwrap()
    }
}

pub fn method(module: &Module, ty: &str, name: &str) -> Token {
    let ty = module.find_type(ty).unwrap().token;
    module.find_method_by_name(ty, name).unwrap().token
}
