//! JSON description of a native function signature.
//!
//! ```json
//! {
//!   "name": "scale",
//!   "returns": "Point",
//!   "params": ["Point", "float64", { "direction": "out", "param": { "type": "pointer", "to": "int32" } }],
//!   "records": { "Point": [{ "name": "x", "type": "float64" }, { "name": "y", "type": "float64" }] }
//! }
//! ```
//!
//! Types are rebuilt for every target pointer width so one file can be
//! classified for all ABIs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use nbridge::signature::MemberSpec;
use nbridge::{
    BridgeError, CallingConvention, Direction, SignatureBuilder, SignatureDescriptor,
    TypeDescriptor, TypeKind,
};
use serde::Deserialize;

const MAX_NESTING: usize = 16;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub convention: Option<String>,
    #[serde(default)]
    pub variadic: bool,
    #[serde(default = "void_type")]
    pub returns: TypeSpec,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub records: BTreeMap<String, Vec<MemberFile>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    Named(String),
    Detailed(DetailedType),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailedType {
    #[serde(rename = "type")]
    pub kind: String,
    /// Pointee of a `pointer`, element of an `array`.
    #[serde(default)]
    pub to: Option<Box<TypeSpec>>,
    #[serde(default)]
    pub len: Option<usize>,
    #[serde(default)]
    pub prototype: Option<Box<SignatureFile>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    Directed { direction: String, param: TypeSpec },
    Bare(TypeSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberFile {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeSpec,
    #[serde(default)]
    pub align: Option<usize>,
}

fn void_type() -> TypeSpec {
    TypeSpec::Named("void".to_string())
}

#[derive(Debug)]
pub enum SignatureFileError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Invalid(String),
    Bridge(BridgeError),
}

impl std::fmt::Display for SignatureFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureFileError::Io(err) => write!(f, "cannot read signature file: {err}"),
            SignatureFileError::Json(err) => write!(f, "invalid signature JSON: {err}"),
            SignatureFileError::Invalid(message) => write!(f, "invalid signature: {message}"),
            SignatureFileError::Bridge(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SignatureFileError {}

impl From<BridgeError> for SignatureFileError {
    fn from(err: BridgeError) -> Self {
        SignatureFileError::Bridge(err)
    }
}

impl SignatureFile {
    pub fn load(path: &Path) -> Result<Self, SignatureFileError> {
        let text = std::fs::read_to_string(path).map_err(SignatureFileError::Io)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SignatureFileError> {
        serde_json::from_str(text).map_err(SignatureFileError::Json)
    }

    /// Descriptor with pointer-like types sized for `pointer_size`.
    pub fn build(&self, pointer_size: usize) -> Result<Arc<SignatureDescriptor>, SignatureFileError> {
        let resolver = Resolver {
            records: &self.records,
            pointer_size,
        };
        resolver.signature(self, 0)
    }
}

struct Resolver<'f> {
    records: &'f BTreeMap<String, Vec<MemberFile>>,
    pointer_size: usize,
}

impl Resolver<'_> {
    fn signature(
        &self,
        file: &SignatureFile,
        depth: usize,
    ) -> Result<Arc<SignatureDescriptor>, SignatureFileError> {
        let mut builder = SignatureBuilder::new(self.ty(&file.returns, depth)?);
        if let Some(name) = &file.name {
            builder = builder.name(name);
        }
        if let Some(convention) = &file.convention {
            builder = builder.convention(parse_convention(convention)?);
        }
        for param in &file.params {
            builder = match param {
                ParamSpec::Bare(spec) => builder.param(self.ty(spec, depth)?),
                ParamSpec::Directed { direction, param } => {
                    builder.param_with_direction(self.ty(param, depth)?, parse_direction(direction)?)
                }
            };
        }
        if file.variadic {
            builder = builder.variadic();
        }
        Ok(builder.build()?)
    }

    fn ty(&self, spec: &TypeSpec, depth: usize) -> Result<Arc<TypeDescriptor>, SignatureFileError> {
        if depth > MAX_NESTING {
            return Err(SignatureFileError::Invalid(format!(
                "types nest deeper than {MAX_NESTING} levels"
            )));
        }
        match spec {
            TypeSpec::Named(name) => self.named(name, depth),
            TypeSpec::Detailed(detailed) => self.detailed(detailed, depth),
        }
    }

    fn named(&self, name: &str, depth: usize) -> Result<Arc<TypeDescriptor>, SignatureFileError> {
        if let Some(kind) = scalar_kind(name) {
            return Ok(TypeDescriptor::scalar_for(kind, self.pointer_size)?);
        }
        if name == "pointer" {
            return Ok(TypeDescriptor::pointer_for(self.pointer_size, None)?);
        }
        let members = self
            .records
            .get(name)
            .ok_or_else(|| SignatureFileError::Invalid(format!("unknown type '{name}'")))?;
        let specs = members
            .iter()
            .map(|member| {
                let ty = self.ty(&member.ty, depth + 1)?;
                Ok(match member.align {
                    Some(align) => MemberSpec::aligned(member.name.clone(), ty, align),
                    None => MemberSpec::new(member.name.clone(), ty),
                })
            })
            .collect::<Result<Vec<_>, SignatureFileError>>()?;
        Ok(TypeDescriptor::record_with(name, specs)?)
    }

    fn detailed(
        &self,
        detailed: &DetailedType,
        depth: usize,
    ) -> Result<Arc<TypeDescriptor>, SignatureFileError> {
        match detailed.kind.as_str() {
            "pointer" => {
                let pointee = detailed
                    .to
                    .as_deref()
                    .map(|spec| self.ty(spec, depth + 1))
                    .transpose()?;
                Ok(TypeDescriptor::pointer_for(self.pointer_size, pointee)?)
            }
            "array" => {
                let element = detailed.to.as_deref().ok_or_else(|| {
                    SignatureFileError::Invalid("array type needs an element in 'to'".to_string())
                })?;
                let len = detailed.len.ok_or_else(|| {
                    SignatureFileError::Invalid("array type needs a 'len'".to_string())
                })?;
                Ok(TypeDescriptor::array(self.ty(element, depth + 1)?, len)?)
            }
            "callback" => {
                let prototype = detailed.prototype.as_deref().ok_or_else(|| {
                    SignatureFileError::Invalid("callback type needs a 'prototype'".to_string())
                })?;
                let prototype = self.signature(prototype, depth + 1)?;
                Ok(TypeDescriptor::callback_for(self.pointer_size, prototype)?)
            }
            other => self.named(other, depth),
        }
    }
}

fn scalar_kind(name: &str) -> Option<TypeKind> {
    let kind = match name {
        "void" => TypeKind::Void,
        "bool" => TypeKind::Bool,
        "int8" => TypeKind::Int8,
        "uint8" => TypeKind::UInt8,
        "int16" => TypeKind::Int16,
        "uint16" => TypeKind::UInt16,
        "int32" => TypeKind::Int32,
        "uint32" => TypeKind::UInt32,
        "int64" => TypeKind::Int64,
        "uint64" => TypeKind::UInt64,
        "float32" => TypeKind::Float32,
        "float64" => TypeKind::Float64,
        "string" => TypeKind::String,
        "wide_string" => TypeKind::WideString,
        _ => return None,
    };
    Some(kind)
}

fn parse_convention(name: &str) -> Result<CallingConvention, SignatureFileError> {
    match name {
        "default" => Ok(CallingConvention::Default),
        "cdecl" => Ok(CallingConvention::Cdecl),
        "stdcall" => Ok(CallingConvention::Stdcall),
        "fastcall" => Ok(CallingConvention::Fastcall),
        "thiscall" => Ok(CallingConvention::Thiscall),
        other => Err(SignatureFileError::Invalid(format!(
            "unknown calling convention '{other}'"
        ))),
    }
}

fn parse_direction(name: &str) -> Result<Direction, SignatureFileError> {
    match name {
        "in" => Ok(Direction::In),
        "out" => Ok(Direction::Out),
        "inout" => Ok(Direction::InOut),
        other => Err(SignatureFileError::Invalid(format!("unknown direction '{other}'"))),
    }
}
