//! Typed views of the rows this crate reads or creates.
//!
//! Each `*Raw` struct mirrors one table row with heap and table indices unresolved, the way the
//! row is stored. `read` decodes row `rid` from a [`TablesStream`]; `to_row` produces the column
//! values for [`TablesStream::push_row`]. Coded indices are exposed as decoded [`Token`]s.

use crate::{
    metadata::{
        tables::{CodedIndexType, TableId, TablesStream},
        token::Token,
    },
    Result,
};

/// `Module` row (II.22.30)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRaw {
    /// Generation, always 0
    pub generation: u32,
    /// `#Strings` index of the module name
    pub name: u32,
    /// `#GUID` index of the module version id
    pub mvid: u32,
    /// `#GUID` index, edit and continue
    pub encid: u32,
    /// `#GUID` index, edit and continue base
    pub encbaseid: u32,
}

impl ModuleRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::Module, rid)?;
        Ok(ModuleRaw {
            generation: row[0],
            name: row[1],
            mvid: row[2],
            encid: row[3],
            encbaseid: row[4],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Never fails; returns `Result` for uniformity with rows holding coded indices.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            self.generation,
            self.name,
            self.mvid,
            self.encid,
            self.encbaseid,
        ])
    }
}

/// `TypeRef` row (II.22.38)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRefRaw {
    /// Row id
    pub rid: u32,
    /// `ResolutionScope` coded index
    pub resolution_scope: Token,
    /// `#Strings` index of the type name
    pub type_name: u32,
    /// `#Strings` index of the namespace
    pub type_namespace: u32,
}

impl TypeRefRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist or the coded index is invalid.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::TypeRef, rid)?;
        Ok(TypeRefRaw {
            rid,
            resolution_scope: CodedIndexType::ResolutionScope.decode(row[0])?,
            type_name: row[1],
            type_namespace: row[2],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Returns an error if the scope token is not a `ResolutionScope` target.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            CodedIndexType::ResolutionScope.encode(self.resolution_scope)?,
            self.type_name,
            self.type_namespace,
        ])
    }
}

/// `TypeDef` row (II.22.37)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefRaw {
    /// Row id
    pub rid: u32,
    /// `TypeAttributes`
    pub flags: u32,
    /// `#Strings` index of the type name
    pub type_name: u32,
    /// `#Strings` index of the namespace
    pub type_namespace: u32,
    /// `TypeDefOrRef` coded index of the base type
    pub extends: Token,
    /// First row of the field list
    pub field_list: u32,
    /// First row of the method list
    pub method_list: u32,
}

impl TypeDefRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist or the coded index is invalid.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::TypeDef, rid)?;
        Ok(TypeDefRaw {
            rid,
            flags: row[0],
            type_name: row[1],
            type_namespace: row[2],
            extends: CodedIndexType::TypeDefOrRef.decode(row[3])?,
            field_list: row[4],
            method_list: row[5],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Returns an error if `extends` is not a `TypeDefOrRef` target.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            self.flags,
            self.type_name,
            self.type_namespace,
            CodedIndexType::TypeDefOrRef.encode(self.extends)?,
            self.field_list,
            self.method_list,
        ])
    }
}

/// `Field` row (II.22.15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRaw {
    /// Row id
    pub rid: u32,
    /// `FieldAttributes`
    pub flags: u32,
    /// `#Strings` index of the name
    pub name: u32,
    /// `#Blob` index of the field signature
    pub signature: u32,
}

impl FieldRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::Field, rid)?;
        Ok(FieldRaw {
            rid,
            flags: row[0],
            name: row[1],
            signature: row[2],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Never fails.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![self.flags, self.name, self.signature])
    }
}

/// `MethodDef` row (II.22.26)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDefRaw {
    /// Row id
    pub rid: u32,
    /// RVA of the method body, 0 if there is none
    pub rva: u32,
    /// `MethodImplAttributes`
    pub impl_flags: u32,
    /// `MethodAttributes`
    pub flags: u32,
    /// `#Strings` index of the name
    pub name: u32,
    /// `#Blob` index of the method signature
    pub signature: u32,
    /// First row of the parameter list
    pub param_list: u32,
}

impl MethodDefRaw {
    /// Column holding the RVA
    pub const RVA_COLUMN: usize = 0;

    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::MethodDef, rid)?;
        Ok(MethodDefRaw {
            rid,
            rva: row[0],
            impl_flags: row[1],
            flags: row[2],
            name: row[3],
            signature: row[4],
            param_list: row[5],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Never fails.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            self.rva,
            self.impl_flags,
            self.flags,
            self.name,
            self.signature,
            self.param_list,
        ])
    }
}

/// `Param` row (II.22.33)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRaw {
    /// Row id
    pub rid: u32,
    /// `ParamAttributes`
    pub flags: u32,
    /// 0 for the return value, 1-based parameter position otherwise
    pub sequence: u32,
    /// `#Strings` index of the name
    pub name: u32,
}

impl ParamRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::Param, rid)?;
        Ok(ParamRaw {
            rid,
            flags: row[0],
            sequence: row[1],
            name: row[2],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Never fails.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![self.flags, self.sequence, self.name])
    }
}

/// `MemberRef` row (II.22.25)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRefRaw {
    /// Row id
    pub rid: u32,
    /// `MemberRefParent` coded index
    pub class: Token,
    /// `#Strings` index of the name
    pub name: u32,
    /// `#Blob` index of the signature
    pub signature: u32,
}

impl MemberRefRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist or the coded index is invalid.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::MemberRef, rid)?;
        Ok(MemberRefRaw {
            rid,
            class: CodedIndexType::MemberRefParent.decode(row[0])?,
            name: row[1],
            signature: row[2],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Returns an error if `class` is not a `MemberRefParent` target.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            CodedIndexType::MemberRefParent.encode(self.class)?,
            self.name,
            self.signature,
        ])
    }
}

/// `Constant` row (II.22.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantRaw {
    /// Row id
    pub rid: u32,
    /// Element type of the value
    pub base: u8,
    /// `HasConstant` coded index of the owner
    pub parent: Token,
    /// `#Blob` index of the value
    pub value: u32,
}

impl ConstantRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist or the coded index is invalid.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::Constant, rid)?;
        Ok(ConstantRaw {
            rid,
            base: (row[0] & 0xFF) as u8,
            parent: CodedIndexType::HasConstant.decode(row[1])?,
            value: row[2],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Returns an error if `parent` is not a `HasConstant` target.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            u32::from(self.base),
            CodedIndexType::HasConstant.encode(self.parent)?,
            self.value,
        ])
    }
}

/// `NestedClass` row (II.22.32)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedClassRaw {
    /// `TypeDef` row of the nested type
    pub nested_class: u32,
    /// `TypeDef` row of the enclosing type
    pub enclosing_class: u32,
}

impl NestedClassRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::NestedClass, rid)?;
        Ok(NestedClassRaw {
            nested_class: row[0],
            enclosing_class: row[1],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Never fails.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![self.nested_class, self.enclosing_class])
    }
}

/// `Assembly` row (II.22.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRaw {
    /// `AssemblyHashAlgorithm`
    pub hash_alg_id: u32,
    /// Version: major, minor, build, revision
    pub version: [u16; 4],
    /// `AssemblyFlags`
    pub flags: u32,
    /// `#Blob` index of the public key
    pub public_key: u32,
    /// `#Strings` index of the name
    pub name: u32,
    /// `#Strings` index of the culture
    pub culture: u32,
}

impl AssemblyRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::Assembly, rid)?;
        Ok(AssemblyRaw {
            hash_alg_id: row[0],
            version: [row[1] as u16, row[2] as u16, row[3] as u16, row[4] as u16],
            flags: row[5],
            public_key: row[6],
            name: row[7],
            culture: row[8],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Never fails.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            self.hash_alg_id,
            u32::from(self.version[0]),
            u32::from(self.version[1]),
            u32::from(self.version[2]),
            u32::from(self.version[3]),
            self.flags,
            self.public_key,
            self.name,
            self.culture,
        ])
    }
}

/// `AssemblyRef` row (II.22.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRefRaw {
    /// Row id
    pub rid: u32,
    /// Version: major, minor, build, revision
    pub version: [u16; 4],
    /// `AssemblyFlags`; bit 0x0001 means `public_key_or_token` holds a full key
    pub flags: u32,
    /// `#Blob` index of the public key or token
    pub public_key_or_token: u32,
    /// `#Strings` index of the name
    pub name: u32,
    /// `#Strings` index of the culture
    pub culture: u32,
    /// `#Blob` index of the hash value
    pub hash_value: u32,
}

impl AssemblyRefRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::AssemblyRef, rid)?;
        Ok(AssemblyRefRaw {
            rid,
            version: [row[0] as u16, row[1] as u16, row[2] as u16, row[3] as u16],
            flags: row[4],
            public_key_or_token: row[5],
            name: row[6],
            culture: row[7],
            hash_value: row[8],
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Never fails.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            u32::from(self.version[0]),
            u32::from(self.version[1]),
            u32::from(self.version[2]),
            u32::from(self.version[3]),
            self.flags,
            self.public_key_or_token,
            self.name,
            self.culture,
            self.hash_value,
        ])
    }
}

/// `ExportedType` row (II.22.14)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedTypeRaw {
    /// Row id
    pub rid: u32,
    /// `TypeAttributes`
    pub flags: u32,
    /// Hint into the target module's `TypeDef` table
    pub type_def_id: u32,
    /// `#Strings` index of the type name
    pub type_name: u32,
    /// `#Strings` index of the namespace
    pub type_namespace: u32,
    /// `Implementation` coded index: `File`, `AssemblyRef` or an enclosing `ExportedType`
    pub implementation: Token,
}

impl ExportedTypeRaw {
    /// Decode row `rid`
    ///
    /// # Errors
    /// Returns an error if the row does not exist or the coded index is invalid.
    pub fn read(tables: &TablesStream, rid: u32) -> Result<Self> {
        let row = tables.row(TableId::ExportedType, rid)?;
        Ok(ExportedTypeRaw {
            rid,
            flags: row[0],
            type_def_id: row[1],
            type_name: row[2],
            type_namespace: row[3],
            implementation: CodedIndexType::Implementation.decode(row[4])?,
        })
    }

    /// Column values for a new row
    ///
    /// # Errors
    /// Returns an error if `implementation` is not an `Implementation` target.
    pub fn to_row(&self) -> Result<Vec<u32>> {
        Ok(vec![
            self.flags,
            self.type_def_id,
            self.type_name,
            self.type_namespace,
            CodedIndexType::Implementation.encode(self.implementation)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_rows() {
        let mut tables = TablesStream::new();
        let type_ref = TypeRefRaw {
            rid: 0,
            resolution_scope: Token::from_parts(TableId::AssemblyRef, 1),
            type_name: 5,
            type_namespace: 9,
        };
        let rid = tables.push_row(TableId::TypeRef, &type_ref.to_row().unwrap()).unwrap();
        assert_eq!(rid, 1);
        // AssemblyRef is tag 2 of ResolutionScope
        assert_eq!(tables.value(TableId::TypeRef, 1, 0).unwrap(), (1 << 2) | 2);

        let read = TypeRefRaw::read(&tables, 1).unwrap();
        assert_eq!(read.resolution_scope, type_ref.resolution_scope);
        assert_eq!(read.rid, 1);

        let member = MemberRefRaw {
            rid: 0,
            class: Token::from_parts(TableId::TypeRef, 1),
            name: 3,
            signature: 1,
        };
        tables.push_row(TableId::MemberRef, &member.to_row().unwrap()).unwrap();
        assert_eq!(MemberRefRaw::read(&tables, 1).unwrap().class, member.class);
    }

    #[test]
    fn constant_base_type() {
        let mut tables = TablesStream::new();
        let constant = ConstantRaw {
            rid: 0,
            base: 0x08,
            parent: Token::from_parts(TableId::Field, 2),
            value: 7,
        };
        tables.push_row(TableId::Constant, &constant.to_row().unwrap()).unwrap();
        let read = ConstantRaw::read(&tables, 1).unwrap();
        assert_eq!(read.base, 0x08);
        assert_eq!(read.parent, constant.parent);

        let bad = ConstantRaw {
            parent: Token::from_parts(TableId::MethodDef, 1),
            ..constant
        };
        assert!(bad.to_row().is_err());
    }
}
