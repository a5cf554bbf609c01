use log::info;

use crate::{
    assembly::{Instruction, OpCode},
    metadata::{
        signatures::{MethodSignature, TypeSig},
        token::Token,
    },
    module::{ExternalMethod, Module},
    patch::{
        unity::{dependency_type_sig, find_unity_engine_type, type_sig},
        Patch,
    },
    Result,
};

// Argument slots of the static `GameDebug::Log`
const ARG_CONTEXT: u16 = 1;
const ARG_FORMAT: u16 = 3;
const ARG_ARGS: u16 = 4;

/// Route `GameDebug::Log` to the engine logger.
///
/// Release builds ship `GameDebug::Log(LogGroup, UnityEngine.Object, LogLevel, string,
/// object[])` with an empty body. The patch replaces it with
///
/// ```text
/// if (args.Length != 0) { UnityEngine.Debug.LogFormat(context, format, args); return; }
/// UnityEngine.Debug.Log(format, context);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameDebugLogPatch {
    /// Type declaring the logger
    pub game_debug: String,
    /// Name of the logging method
    pub method: String,
    /// Enum of the first parameter
    pub log_group: String,
    /// Enum of the third parameter
    pub log_level: String,
    /// Engine type of the context parameter
    pub engine_object: String,
    /// Engine type providing `Log` and `LogFormat`
    pub engine_debug: String,
}

impl Default for GameDebugLogPatch {
    fn default() -> Self {
        GameDebugLogPatch {
            game_debug: "GameDebug".to_string(),
            method: "Log".to_string(),
            log_group: "LogGroup".to_string(),
            log_level: "LogLevel".to_string(),
            engine_object: "UnityEngine.Object".to_string(),
            engine_debug: "UnityEngine.Debug".to_string(),
        }
    }
}

/// Everything the new body needs, looked up before anything is staged
struct Targets {
    method: Token,
    log_format: ExternalMethod,
    log: ExternalMethod,
}

impl GameDebugLogPatch {
    fn resolve(&self, module: &Module) -> Result<Targets> {
        let game_debug = module.find_type(&self.game_debug)?;
        let log_group = type_sig(module, module.find_type(&self.log_group)?)?;
        let log_level = type_sig(module, module.find_type(&self.log_level)?)?;
        let engine_object = dependency_type_sig(&find_unity_engine_type(module, &self.engine_object)?)?;
        let object_array = TypeSig::sz_array(TypeSig::Object);

        let signature = MethodSignature::new_static(
            TypeSig::Void,
            vec![
                log_group,
                engine_object.clone(),
                log_level,
                TypeSig::String,
                object_array.clone(),
            ],
        );
        let method = module.find_method(game_debug.token, &self.method, &signature)?;
        info!("  Log method found: {} {}", method.qualified_name, signature);

        let debug = find_unity_engine_type(module, &self.engine_debug)?;
        let log_format = debug.external_method(
            "LogFormat",
            &MethodSignature::new_static(
                TypeSig::Void,
                vec![engine_object.clone(), TypeSig::String, object_array],
            ),
        )?;
        let log = debug.external_method(
            "Log",
            &MethodSignature::new_static(TypeSig::Void, vec![TypeSig::Object, engine_object]),
        )?;

        Ok(Targets {
            method: method.token,
            log_format,
            log,
        })
    }
}

impl Patch for GameDebugLogPatch {
    fn name(&self) -> &str {
        "GameDebug Log Implementation"
    }

    fn apply(&self, module: &mut Module) -> Result<()> {
        let targets = self.resolve(module)?;

        module.transaction(|tx| {
            let log_format = tx.import_method(&targets.log_format)?;
            let log = tx.import_method(&targets.log)?;

            let mut editor = tx.editor(targets.method)?;
            editor.clear();

            let empty_args = editor.create(Instruction::ldarg(ARG_FORMAT));

            editor.append(Instruction::ldarg(ARG_ARGS));
            editor.append(Instruction::simple(OpCode::LDLEN));
            editor.append(Instruction::branch(OpCode::BRFALSE, empty_args));

            editor.append(Instruction::ldarg(ARG_CONTEXT));
            editor.append(Instruction::ldarg(ARG_FORMAT));
            editor.append(Instruction::ldarg(ARG_ARGS));
            editor.append(Instruction::token(OpCode::CALL, log_format));
            editor.append(Instruction::simple(OpCode::RET));

            editor.append_existing(empty_args)?;
            editor.append(Instruction::ldarg(ARG_CONTEXT));
            editor.append(Instruction::token(OpCode::CALL, log));
            editor.append(Instruction::simple(OpCode::RET));

            tx.replace_body(&editor)
        })?;

        info!("  Replaced the body of {}::{}", self.game_debug, self.method);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decode_stream, Operand},
        metadata::tables::TableId,
        test::game_module,
        Error,
    };

    fn log_method(module: &Module) -> Token {
        let game_debug = module.find_type("GameDebug").unwrap().token;
        module
            .types()
            .iter()
            .find(|ty| ty.token == game_debug)
            .unwrap()
            .methods[0]
    }

    #[test]
    fn replaces_body() {
        let mut module = game_module();
        let method = log_method(&module);
        GameDebugLogPatch::default().apply(&mut module).unwrap();

        let body = module.body(method).unwrap();
        assert_eq!(body.instruction_count(), 12);
        assert_eq!(body.max_stack(), 3);

        let decoded = decode_stream(body.code()).unwrap();
        let ops: Vec<_> = decoded.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            [
                OpCode::LDARG_S,
                OpCode::LDLEN,
                OpCode::BRFALSE_S,
                OpCode::LDARG_1,
                OpCode::LDARG_3,
                OpCode::LDARG_S,
                OpCode::CALL,
                OpCode::RET,
                OpCode::LDARG_3,
                OpCode::LDARG_1,
                OpCode::CALL,
                OpCode::RET,
            ]
        );

        // brfalse.s lands on the single-argument call
        let Operand::Target(target) = decoded[2].operand else {
            panic!("brfalse without target");
        };
        assert_eq!(target, decoded[8].offset);

        let calls: Vec<_> = [6, 10]
            .iter()
            .map(|index| match decoded[*index].operand {
                Operand::Token(token) => token,
                _ => panic!("call without token"),
            })
            .collect();
        assert!(calls.iter().all(|token| token.is_table(TableId::MemberRef)));
        assert_ne!(calls[0], calls[1]);
        assert!(module.metadata_changed());
    }

    #[test]
    fn missing_engine_type_leaves_module_untouched() {
        let mut module = game_module();
        let patch = GameDebugLogPatch {
            engine_debug: "UnityEngine.Logger".to_string(),
            ..GameDebugLogPatch::default()
        };
        assert!(matches!(
            patch.apply(&mut module),
            Err(Error::SymbolNotFound(message)) if message.contains("UnityEngine.Logger")
        ));
        assert!(!module.is_modified());
    }

    #[test]
    fn overload_must_match_exactly() {
        let mut module = game_module();
        let patch = GameDebugLogPatch {
            log_level: "LogGroup".to_string(),
            ..GameDebugLogPatch::default()
        };
        assert!(matches!(
            patch.apply(&mut module),
            Err(Error::SignatureMismatch { candidates: 2, .. })
        ));
    }
}
