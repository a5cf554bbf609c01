//! Conditional guards: load a value, compare it with a constant, branch.
//!
//! A guard is the three or four instruction sequence
//!
//! ```text
//! ldarg.N | ldarg.0; ldfld F
//! ldc.i4  C
//! beq | bne.un  TARGET
//! ```
//!
//! spliced into an existing body. Its target is an offset anchor of the original body, and the
//! constant may be read from an enum member so the guard follows whatever value the loaded
//! build assigns to it.

use std::fmt;

use log::{debug, info};

use crate::{
    assembly::{Anchor, InstrId, Instruction, InstructionEditor, OpCode},
    metadata::{signatures::MethodSignature, token::Token},
    module::{MethodDef, Module, Transaction},
    patch::Patch,
    Error, Result,
};

/// The value a guard inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardSubject {
    /// Argument slot, counting `this` as slot 0 of instance methods
    Argument(u16),
    /// Parameter by name, from the `Param` table
    Parameter(String),
    /// Instance field of the method's declaring type, loaded through `this`
    ThisField(String),
}

/// The constant a guard compares against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardConstant {
    /// A fixed value
    Literal(i32),
    /// The `int32` value of an enum member in the patched module
    EnumMember {
        /// Full name of the enum, nested types joined with `/`
        enum_type: String,
        /// Member name
        member: String,
    },
}

impl GuardConstant {
    /// The member `member` of the enum `enum_type`
    #[must_use]
    pub fn enum_member(enum_type: impl Into<String>, member: impl Into<String>) -> Self {
        GuardConstant::EnumMember {
            enum_type: enum_type.into(),
            member: member.into(),
        }
    }

    /// The value in `module`.
    ///
    /// # Errors
    /// - [`Error::SymbolNotFound`] if the enum or its member is missing, or the type is no enum
    /// - [`Error::ConstantTypeMismatch`] if the member is not an `int32` constant
    pub fn resolve(&self, module: &Module) -> Result<i32> {
        match self {
            GuardConstant::Literal(value) => Ok(*value),
            GuardConstant::EnumMember { enum_type, member } => {
                let ty = module.find_type(enum_type)?;
                if !module.is_enum(ty.token)? {
                    return Err(Error::SymbolNotFound(format!(
                        "enum {enum_type}, the type does not derive from System.Enum"
                    )));
                }
                let value = module.find_field(ty.token, member)?.as_i32()?;
                debug!("{}::{} = {}", enum_type, member, value);
                Ok(value)
            }
        }
    }
}

/// How the subject is compared with the constant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Branch if equal (`beq`)
    Equal,
    /// Branch if not equal (`bne.un`)
    NotEqual,
}

impl Comparison {
    /// The branch opcode; the short form is chosen during finalize
    #[must_use]
    pub fn opcode(self) -> OpCode {
        match self {
            Comparison::Equal => OpCode::BEQ,
            Comparison::NotEqual => OpCode::BNE_UN,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        })
    }
}

/// A compare-and-branch over a subject, a constant and an anchored target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalGuard {
    /// Value to inspect
    pub subject: GuardSubject,
    /// Value to compare with
    pub constant: GuardConstant,
    /// Branch condition
    pub comparison: Comparison,
    /// Where the branch goes when the condition holds
    pub target: Anchor,
}

impl ConditionalGuard {
    /// A guard branching to `target` when `subject comparison constant` holds
    #[must_use]
    pub fn new(
        subject: GuardSubject,
        constant: GuardConstant,
        comparison: Comparison,
        target: Anchor,
    ) -> Self {
        ConditionalGuard {
            subject,
            constant,
            comparison,
            target,
        }
    }

    fn load_subject(&self, module: &Module, method: &MethodDef) -> Result<Vec<Instruction>> {
        match &self.subject {
            GuardSubject::Argument(slot) => {
                let count = method.signature.params.len() + usize::from(method.signature.has_this);
                if usize::from(*slot) >= count {
                    return Err(Error::IndexOutOfRange {
                        index: usize::from(*slot),
                        len: count,
                    });
                }
                Ok(vec![Instruction::ldarg(*slot)])
            }
            GuardSubject::Parameter(name) => method
                .arg_slot(name)
                .map(|slot| vec![Instruction::ldarg(slot)])
                .ok_or_else(|| {
                    Error::SymbolNotFound(format!(
                        "parameter {} of {}",
                        name, method.qualified_name
                    ))
                }),
            GuardSubject::ThisField(name) => {
                if !method.signature.has_this {
                    return Err(Error::NotSupported(format!(
                        "{} is static and has no field {}",
                        method.qualified_name, name
                    )));
                }
                let field = module.find_field(method.declaring_type, name)?;
                if field.flags.is_static() {
                    return Err(Error::NotSupported(format!(
                        "{} is static and cannot be loaded through this",
                        field.qualified_name
                    )));
                }
                Ok(vec![
                    Instruction::ldarg(0),
                    Instruction::token(OpCode::LDFLD, field.token),
                ])
            }
        }
    }

    /// The guard instructions for `method`, branching to the already located `target`.
    ///
    /// # Errors
    /// Returns the lookup error of the subject or the constant.
    pub fn instructions(
        &self,
        module: &Module,
        method: &MethodDef,
        target: InstrId,
    ) -> Result<Vec<Instruction>> {
        let mut sequence = self.load_subject(module, method)?;
        sequence.push(Instruction::ldc_i4(self.constant.resolve(module)?));
        sequence.push(Instruction::branch(self.comparison.opcode(), target));
        Ok(sequence)
    }

    /// Insert the guard into `editor` so that it starts at `index`. Returns the id of its first
    /// instruction.
    ///
    /// Every lookup happens before the editor is touched.
    ///
    /// # Errors
    /// - the anchor errors of [`InstructionEditor::locate`] for the target
    /// - the lookup errors of [`Self::instructions`]
    /// - [`Error::IndexOutOfRange`] if `index > editor.len()`
    pub fn insert(
        &self,
        module: &Module,
        editor: &mut InstructionEditor,
        index: usize,
    ) -> Result<InstrId> {
        let method = module.method(editor.token())?;
        let target = editor.locate(&self.target)?;
        let sequence = self.instructions(module, method, target)?;
        if index > editor.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: editor.len(),
            });
        }

        let mut first = None;
        for (offset, instruction) in sequence.into_iter().enumerate() {
            let id = editor.insert_at(index + offset, instruction)?;
            first.get_or_insert(id);
        }
        first.ok_or_else(|| Error::NotSupported("empty guard".to_string()))
    }
}

/// Where a guard goes relative to its anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPosition {
    /// Directly in front of the anchored instruction
    Before(Anchor),
    /// Directly behind the anchored instruction
    After(Anchor),
}

impl GuardPosition {
    fn anchor(&self) -> &Anchor {
        match self {
            GuardPosition::Before(anchor) | GuardPosition::After(anchor) => anchor,
        }
    }
}

/// Insert one [`ConditionalGuard`] into one method.
///
/// With `retarget_incoming`, branches that went to the instruction the guard now precedes are
/// sent to the guard instead, so the guard also runs on those paths.
#[derive(Debug, Clone)]
pub struct ConditionalGuardPatch {
    /// Name for reports
    pub name: String,
    /// Full name of the declaring type
    pub type_name: String,
    /// Method name
    pub method: String,
    /// Exact signature, required if the method is overloaded
    pub signature: Option<MethodSignature>,
    /// Insertion point
    pub position: GuardPosition,
    /// The guard
    pub guard: ConditionalGuard,
    /// Redirect branches into the insertion point to the guard
    pub retarget_incoming: bool,
}

impl ConditionalGuardPatch {
    /// Guard `type_name::method` at `position`, without retargeting
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        method: impl Into<String>,
        position: GuardPosition,
        guard: ConditionalGuard,
    ) -> Self {
        ConditionalGuardPatch {
            name: name.into(),
            type_name: type_name.into(),
            method: method.into(),
            signature: None,
            position,
            guard,
            retarget_incoming: false,
        }
    }

    /// Require the exact `signature`
    #[must_use]
    pub fn with_signature(mut self, signature: MethodSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Redirect branches into the insertion point to the guard
    #[must_use]
    pub fn retarget_incoming(mut self, retarget: bool) -> Self {
        self.retarget_incoming = retarget;
        self
    }

    fn target_method(&self, module: &Module) -> Result<Token> {
        let ty = module.find_type(&self.type_name)?.token;
        let method = match &self.signature {
            Some(signature) => module.find_method(ty, &self.method, signature)?,
            None => module.find_method_by_name(ty, &self.method)?,
        };
        Ok(method.token)
    }

    fn stage(&self, tx: &mut Transaction<'_>) -> Result<()> {
        let module = tx.module();
        let method = self.target_method(module)?;
        let mut editor = tx.editor(method)?;

        let anchor = editor.locate(self.position.anchor())?;
        let anchor_index = editor
            .position(anchor)
            .ok_or_else(|| Error::AnchorInvalidated(editor.method().to_string()))?;
        let index = match self.position {
            GuardPosition::Before(_) => anchor_index,
            GuardPosition::After(_) => anchor_index + 1,
        };
        let successor = editor.id_at(index).ok();

        let before = editor.len();
        let first = self.guard.insert(module, &mut editor, index)?;
        if let (true, Some(successor)) = (self.retarget_incoming, successor) {
            let branch_index = index + (editor.len() - before) - 1;
            let own = editor.get(editor.id_at(branch_index)?).cloned();
            let redirected = editor.redirect_branches(successor, first);

            // The guard's own branch keeps its target
            if let Some(own) = own.filter(|own| own.targets().contains(&successor)) {
                editor.replace_at(branch_index, own)?;
            }
            debug!(
                "Redirected {} branch operands of {} to the guard",
                redirected,
                editor.method()
            );
        }

        tx.replace_body(&editor)
    }
}

impl Patch for ConditionalGuardPatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, module: &mut Module) -> Result<()> {
        module.transaction(|tx| self.stage(tx))?;
        info!(
            "Guarded {}::{} ({:?} {} {:?})",
            self.type_name,
            self.method,
            self.guard.subject,
            self.guard.comparison,
            self.guard.constant
        );
        Ok(())
    }
}
