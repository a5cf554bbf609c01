//! Decoding of signature blobs into [`TypeSig`]-based signatures.

use crate::{
    file::parser::Parser,
    metadata::{
        signatures::{
            FieldSignature, MemberSignature, MethodSignature, TypeName, TypeSig, ELEMENT_TYPE,
            SIG_EXPLICIT_THIS, SIG_FIELD, SIG_GENERIC, SIG_GENERIC_INST, SIG_HAS_THIS,
        },
        token::Token,
    },
    Error::RecursionLimit,
    Result,
};

const MAX_RECURSION_DEPTH: usize = 50;

/// Maps the `TypeDefOrRef` tokens of a blob to the names they designate
pub trait TypeNameResolver {
    /// Resolve a `TypeDef` or `TypeRef` token of the module that owns the blob.
    ///
    /// # Errors
    /// Returns an error if the token does not designate a named type.
    fn resolve_type_name(&self, token: Token) -> Result<TypeName>;
}

impl<F> TypeNameResolver for F
where
    F: Fn(Token) -> Result<TypeName>,
{
    fn resolve_type_name(&self, token: Token) -> Result<TypeName> {
        self(token)
    }
}

/// Signature blob decoder
pub struct SignatureParser<'a, 'r> {
    parser: Parser<'a>,
    resolver: &'r dyn TypeNameResolver,
    depth: usize,
}

impl<'a, 'r> SignatureParser<'a, 'r> {
    /// Create a parser over `data`, resolving type tokens through `resolver`
    #[must_use]
    pub fn new(data: &'a [u8], resolver: &'r dyn TypeNameResolver) -> Self {
        SignatureParser {
            parser: Parser::new(data),
            resolver,
            depth: 0,
        }
    }

    fn parse_type(&mut self) -> Result<TypeSig> {
        self.depth += 1;
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(RecursionLimit(MAX_RECURSION_DEPTH));
        }

        let result = self.parse_type_inner();
        self.depth -= 1;
        result
    }

    fn parse_type_inner(&mut self) -> Result<TypeSig> {
        let current_byte = self.parser.read_le::<u8>()?;
        match current_byte {
            ELEMENT_TYPE::VOID => Ok(TypeSig::Void),
            ELEMENT_TYPE::BOOLEAN => Ok(TypeSig::Boolean),
            ELEMENT_TYPE::CHAR => Ok(TypeSig::Char),
            ELEMENT_TYPE::I1 => Ok(TypeSig::I1),
            ELEMENT_TYPE::U1 => Ok(TypeSig::U1),
            ELEMENT_TYPE::I2 => Ok(TypeSig::I2),
            ELEMENT_TYPE::U2 => Ok(TypeSig::U2),
            ELEMENT_TYPE::I4 => Ok(TypeSig::I4),
            ELEMENT_TYPE::U4 => Ok(TypeSig::U4),
            ELEMENT_TYPE::I8 => Ok(TypeSig::I8),
            ELEMENT_TYPE::U8 => Ok(TypeSig::U8),
            ELEMENT_TYPE::R4 => Ok(TypeSig::R4),
            ELEMENT_TYPE::R8 => Ok(TypeSig::R8),
            ELEMENT_TYPE::STRING => Ok(TypeSig::String),
            ELEMENT_TYPE::OBJECT => Ok(TypeSig::Object),
            ELEMENT_TYPE::I => Ok(TypeSig::I),
            ELEMENT_TYPE::U => Ok(TypeSig::U),
            ELEMENT_TYPE::TYPEDBYREF => Ok(TypeSig::TypedByRef),
            ELEMENT_TYPE::PTR => Ok(TypeSig::Ptr(Box::new(self.parse_type()?))),
            ELEMENT_TYPE::BYREF => Ok(TypeSig::ByRef(Box::new(self.parse_type()?))),
            ELEMENT_TYPE::PINNED => Ok(TypeSig::Pinned(Box::new(self.parse_type()?))),
            ELEMENT_TYPE::SZARRAY => Ok(TypeSig::SzArray(Box::new(self.parse_type()?))),
            ELEMENT_TYPE::VALUETYPE => Ok(TypeSig::ValueType(self.parse_type_name()?)),
            ELEMENT_TYPE::CLASS => Ok(TypeSig::Class(self.parse_type_name()?)),
            ELEMENT_TYPE::VAR => Ok(TypeSig::Var(self.parser.read_compressed_uint()?)),
            ELEMENT_TYPE::MVAR => Ok(TypeSig::MVar(self.parser.read_compressed_uint()?)),
            ELEMENT_TYPE::ARRAY => {
                let base = self.parse_type()?;
                let rank = self.parser.read_compressed_uint()?;

                let num_sizes = self.parser.read_compressed_uint()?;
                let mut sizes = Vec::with_capacity(num_sizes.min(rank) as usize);
                for _ in 0..num_sizes {
                    sizes.push(self.parser.read_compressed_uint()?);
                }

                let num_lo_bounds = self.parser.read_compressed_uint()?;
                let mut lower_bounds = Vec::with_capacity(num_lo_bounds.min(rank) as usize);
                for _ in 0..num_lo_bounds {
                    lower_bounds.push(self.parser.read_compressed_int()?);
                }

                Ok(TypeSig::Array {
                    base: Box::new(base),
                    rank,
                    sizes,
                    lower_bounds,
                })
            }
            ELEMENT_TYPE::GENERICINST => {
                let peek_byte = self.parser.peek_byte()?;
                if peek_byte != ELEMENT_TYPE::CLASS && peek_byte != ELEMENT_TYPE::VALUETYPE {
                    return Err(malformed_error!(
                        "GENERICINST - Next byte is not TYPE_CLASS or TYPE_VALUE - {}",
                        peek_byte
                    ));
                }

                let base = self.parse_type()?;
                let arg_count = self.parser.read_compressed_uint()?;

                let mut args = Vec::with_capacity(arg_count.min(64) as usize);
                for _ in 0..arg_count {
                    args.push(self.parse_type()?);
                }

                Ok(TypeSig::GenericInst {
                    base: Box::new(base),
                    args,
                })
            }
            ELEMENT_TYPE::FNPTR => Ok(TypeSig::FnPtr(Box::new(self.parse_method_signature()?))),
            ELEMENT_TYPE::CMOD_REQD | ELEMENT_TYPE::CMOD_OPT => {
                let modifier = self.parse_type_name()?;
                Ok(TypeSig::Modified {
                    required: current_byte == ELEMENT_TYPE::CMOD_REQD,
                    modifier,
                    base: Box::new(self.parse_type()?),
                })
            }
            _ => Err(malformed_error!(
                "Unsupported ELEMENT_TYPE - {}",
                current_byte
            )),
        }
    }

    fn parse_type_name(&mut self) -> Result<TypeName> {
        let token = self.parser.read_compressed_token()?;
        self.resolver.resolve_type_name(token)
    }

    /// Parse a method definition, reference or stand-alone call site signature.
    ///
    /// # Errors
    /// Returns an error for malformed data or unresolvable type tokens.
    pub fn parse_method_signature(&mut self) -> Result<MethodSignature> {
        let convention_byte = self.parser.read_le::<u8>()?;
        if convention_byte & 0x0F > 0x05 {
            return Err(malformed_error!(
                "SignatureMethod - invalid calling convention - {}",
                convention_byte
            ));
        }

        let generic_param_count = if convention_byte & SIG_GENERIC != 0 {
            self.parser.read_compressed_uint()?
        } else {
            0
        };

        let param_count = self.parser.read_compressed_uint()?;
        let return_type = self.parse_type()?;

        let mut params = Vec::with_capacity(param_count.min(64) as usize);
        let mut varargs = Vec::new();
        let mut after_sentinel = false;
        for _ in 0..param_count {
            if self.parser.peek_byte()? == ELEMENT_TYPE::SENTINEL {
                self.parser.advance_by(1)?;
                after_sentinel = true;
            }

            let param = self.parse_type()?;
            if after_sentinel {
                varargs.push(param);
            } else {
                params.push(param);
            }
        }

        Ok(MethodSignature {
            has_this: convention_byte & SIG_HAS_THIS != 0,
            explicit_this: convention_byte & SIG_EXPLICIT_THIS != 0,
            calling_convention: convention_byte & 0x0F,
            generic_param_count,
            return_type,
            params,
            varargs,
        })
    }

    /// Parse a field signature.
    ///
    /// # Errors
    /// Returns an error for malformed data or unresolvable type tokens.
    pub fn parse_field_signature(&mut self) -> Result<FieldSignature> {
        let head_byte = self.parser.read_le::<u8>()?;
        if head_byte != SIG_FIELD {
            return Err(malformed_error!(
                "SignatureField - invalid start - {}",
                head_byte
            ));
        }

        Ok(FieldSignature {
            field_type: self.parse_type()?,
        })
    }

    /// Parse a `MemberRef` signature, which is either a field or a method signature.
    ///
    /// # Errors
    /// Returns an error for malformed data or unresolvable type tokens.
    pub fn parse_member_signature(&mut self) -> Result<MemberSignature> {
        if self.parser.peek_byte()? == SIG_FIELD {
            Ok(MemberSignature::Field(self.parse_field_signature()?))
        } else {
            Ok(MemberSignature::Method(self.parse_method_signature()?))
        }
    }

    /// Parse the instantiation of a `MethodSpec` (II.23.2.15).
    ///
    /// # Errors
    /// Returns an error for malformed data or unresolvable type tokens.
    pub fn parse_method_spec(&mut self) -> Result<Vec<TypeSig>> {
        let head_byte = self.parser.read_le::<u8>()?;
        if head_byte != SIG_GENERIC_INST {
            return Err(malformed_error!(
                "SignatureMethodSpec - invalid start - {}",
                head_byte
            ));
        }

        let count = self.parser.read_compressed_uint()?;
        let mut args = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            args.push(self.parse_type()?);
        }
        Ok(args)
    }
}
