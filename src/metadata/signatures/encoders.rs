//! Encoding of [`TypeSig`]-based signatures into blobs.
//!
//! Named types have to be turned back into `TypeDefOrRef` tokens of the module that will own the
//! blob. That mapping is supplied by a [`TypeTokenProvider`], which may create `TypeRef` rows on
//! the fly while a patch imports a member.

use crate::{
    file::io::{push_compressed_int, push_compressed_uint},
    metadata::{
        signatures::{
            FieldSignature, MethodSignature, TypeName, TypeSig, ELEMENT_TYPE, SIG_FIELD,
        },
        tables::TableId,
        token::Token,
    },
    Error, Result,
};

/// Maps named types to `TypeDef` or `TypeRef` tokens of the target module
pub trait TypeTokenProvider {
    /// Return a token for `name`, creating a reference if needed.
    ///
    /// # Errors
    /// Returns an error if no token can be produced for the type.
    fn type_token(&mut self, name: &TypeName) -> Result<Token>;
}

impl<F> TypeTokenProvider for F
where
    F: FnMut(&TypeName) -> Result<Token>,
{
    fn type_token(&mut self, name: &TypeName) -> Result<Token> {
        self(name)
    }
}

fn push_type_token(out: &mut Vec<u8>, token: Token) -> Result<()> {
    let tag = match token.table_id() {
        Some(TableId::TypeDef) => 0,
        Some(TableId::TypeRef) => 1,
        Some(TableId::TypeSpec) => 2,
        _ => return Err(Error::InvalidToken(token)),
    };

    push_compressed_uint(out, (token.row() << 2) | tag)
}

/// Append the encoding of `sig` to `out`.
///
/// # Errors
/// Returns an error if a named type cannot be mapped or a value cannot be compressed.
pub fn encode_type(
    sig: &TypeSig,
    provider: &mut dyn TypeTokenProvider,
    out: &mut Vec<u8>,
) -> Result<()> {
    if let Some(element_type) = sig.primitive_element_type() {
        out.push(element_type);
        return Ok(());
    }

    match sig {
        TypeSig::Class(name) | TypeSig::ValueType(name) => {
            out.push(if matches!(sig, TypeSig::Class(_)) {
                ELEMENT_TYPE::CLASS
            } else {
                ELEMENT_TYPE::VALUETYPE
            });
            push_type_token(out, provider.type_token(name)?)?;
        }
        TypeSig::Var(index) => {
            out.push(ELEMENT_TYPE::VAR);
            push_compressed_uint(out, *index)?;
        }
        TypeSig::MVar(index) => {
            out.push(ELEMENT_TYPE::MVAR);
            push_compressed_uint(out, *index)?;
        }
        TypeSig::SzArray(element) => {
            out.push(ELEMENT_TYPE::SZARRAY);
            encode_type(element, provider, out)?;
        }
        TypeSig::Array {
            base,
            rank,
            sizes,
            lower_bounds,
        } => {
            out.push(ELEMENT_TYPE::ARRAY);
            encode_type(base, provider, out)?;
            push_compressed_uint(out, *rank)?;
            #[allow(clippy::cast_possible_truncation)]
            push_compressed_uint(out, sizes.len() as u32)?;
            for size in sizes {
                push_compressed_uint(out, *size)?;
            }
            #[allow(clippy::cast_possible_truncation)]
            push_compressed_uint(out, lower_bounds.len() as u32)?;
            for bound in lower_bounds {
                push_compressed_int(out, *bound)?;
            }
        }
        TypeSig::GenericInst { base, args } => {
            out.push(ELEMENT_TYPE::GENERICINST);
            encode_type(base, provider, out)?;
            #[allow(clippy::cast_possible_truncation)]
            push_compressed_uint(out, args.len() as u32)?;
            for arg in args {
                encode_type(arg, provider, out)?;
            }
        }
        TypeSig::Ptr(element) => {
            out.push(ELEMENT_TYPE::PTR);
            encode_type(element, provider, out)?;
        }
        TypeSig::ByRef(element) => {
            out.push(ELEMENT_TYPE::BYREF);
            encode_type(element, provider, out)?;
        }
        TypeSig::Pinned(element) => {
            out.push(ELEMENT_TYPE::PINNED);
            encode_type(element, provider, out)?;
        }
        TypeSig::FnPtr(method) => {
            out.push(ELEMENT_TYPE::FNPTR);
            encode_method_signature_into(method, provider, out)?;
        }
        TypeSig::Modified {
            required,
            modifier,
            base,
        } => {
            out.push(if *required {
                ELEMENT_TYPE::CMOD_REQD
            } else {
                ELEMENT_TYPE::CMOD_OPT
            });
            push_type_token(out, provider.type_token(modifier)?)?;
            encode_type(base, provider, out)?;
        }
        _ => {
            return Err(malformed_error!("Type {} has no signature encoding", sig));
        }
    }

    Ok(())
}

fn encode_method_signature_into(
    sig: &MethodSignature,
    provider: &mut dyn TypeTokenProvider,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.push(sig.convention_byte());
    if sig.generic_param_count > 0 {
        push_compressed_uint(out, sig.generic_param_count)?;
    }

    #[allow(clippy::cast_possible_truncation)]
    push_compressed_uint(out, (sig.params.len() + sig.varargs.len()) as u32)?;
    encode_type(&sig.return_type, provider, out)?;
    for param in &sig.params {
        encode_type(param, provider, out)?;
    }

    if !sig.varargs.is_empty() {
        out.push(ELEMENT_TYPE::SENTINEL);
        for param in &sig.varargs {
            encode_type(param, provider, out)?;
        }
    }

    Ok(())
}

/// Encode a method signature blob.
///
/// # Errors
/// Returns an error if a named type cannot be mapped.
pub fn encode_method_signature(
    sig: &MethodSignature,
    provider: &mut dyn TypeTokenProvider,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_method_signature_into(sig, provider, &mut out)?;
    Ok(out)
}

/// Encode a field signature blob.
///
/// # Errors
/// Returns an error if a named type cannot be mapped.
pub fn encode_field_signature(
    sig: &FieldSignature,
    provider: &mut dyn TypeTokenProvider,
) -> Result<Vec<u8>> {
    let mut out = vec![SIG_FIELD];
    encode_type(&sig.field_type, provider, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::signatures::SignatureParser;

    struct Names(Vec<TypeName>);

    impl TypeTokenProvider for Names {
        fn type_token(&mut self, name: &TypeName) -> Result<Token> {
            let position = match self.0.iter().position(|known| known == name) {
                Some(position) => position,
                None => {
                    self.0.push(name.clone());
                    self.0.len() - 1
                }
            };
            #[allow(clippy::cast_possible_truncation)]
            Ok(Token::from_parts(TableId::TypeRef, position as u32 + 1))
        }
    }

    #[test]
    fn method_blob() {
        let sig = MethodSignature::new_static(
            TypeSig::Void,
            vec![TypeSig::Object, TypeSig::class("UnityEngine.Object")],
        );

        let mut names = Names(Vec::new());
        let blob = encode_method_signature(&sig, &mut names).unwrap();
        assert_eq!(blob, [0x00, 0x02, 0x01, 0x1C, 0x12, 0x05]);

        let resolve = |token: Token| -> Result<TypeName> { Ok(names.0[token.row() as usize - 1].clone()) };
        let parsed = SignatureParser::new(&blob, &resolve).parse_method_signature().unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn nested_types_and_varargs() {
        let mut sig = MethodSignature::new_instance(
            TypeSig::generic(TypeSig::class("List`1"), vec![TypeSig::MVar(0)]),
            vec![TypeSig::by_ref(TypeSig::sz_array(TypeSig::value_type("Game.Point")))],
        );
        sig.generic_param_count = 1;
        sig.calling_convention = 5;
        sig.varargs.push(TypeSig::I8);

        let mut names = Names(Vec::new());
        let blob = encode_method_signature(&sig, &mut names).unwrap();
        assert_eq!(blob[0], 0x35);

        let resolve = |token: Token| -> Result<TypeName> { Ok(names.0[token.row() as usize - 1].clone()) };
        let parsed = SignatureParser::new(&blob, &resolve).parse_method_signature().unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn field_blob() {
        let sig = FieldSignature {
            field_type: TypeSig::I4,
        };
        let mut names = Names(Vec::new());
        assert_eq!(encode_field_signature(&sig, &mut names).unwrap(), [0x06, 0x08]);
    }

    #[test]
    fn rejects_foreign_tokens() {
        let mut provider = |_: &TypeName| -> Result<Token> { Ok(Token::from_parts(TableId::MethodDef, 1)) };
        let sig = FieldSignature {
            field_type: TypeSig::class("A"),
        };
        assert!(encode_field_signature(&sig, &mut provider).is_err());
    }
}
