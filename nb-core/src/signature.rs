use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};

pub const MAX_PARAMETERS: usize = 32;
pub const MAX_OUT_PARAMETERS: usize = 8;
/// Strictest alignment the call arena can hand out.
pub const MAX_ALIGN: usize = 16;

pub const HOST_POINTER_SIZE: usize = std::mem::size_of::<usize>();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    WideString,
    Pointer,
    Record,
    Array,
    Callback,
}

impl TypeKind {
    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Void => "Void",
            TypeKind::Bool => "Bool",
            TypeKind::Int8 => "Int8",
            TypeKind::UInt8 => "UInt8",
            TypeKind::Int16 => "Int16",
            TypeKind::UInt16 => "UInt16",
            TypeKind::Int32 => "Int32",
            TypeKind::UInt32 => "UInt32",
            TypeKind::Int64 => "Int64",
            TypeKind::UInt64 => "UInt64",
            TypeKind::Float32 => "Float32",
            TypeKind::Float64 => "Float64",
            TypeKind::String => "String",
            TypeKind::WideString => "WideString",
            TypeKind::Pointer => "Pointer",
            TypeKind::Record => "Record",
            TypeKind::Array => "Array",
            TypeKind::Callback => "Callback",
        }
    }

    /// Integer-class kinds, `Bool` included.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            TypeKind::Bool
                | TypeKind::Int8
                | TypeKind::UInt8
                | TypeKind::Int16
                | TypeKind::UInt16
                | TypeKind::Int32
                | TypeKind::UInt32
                | TypeKind::Int64
                | TypeKind::UInt64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            TypeKind::Int8 | TypeKind::Int16 | TypeKind::Int32 | TypeKind::Int64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, TypeKind::Float32 | TypeKind::Float64)
    }

    /// Kinds represented natively by a single machine pointer.
    pub fn is_pointer_like(self) -> bool {
        matches!(
            self,
            TypeKind::String | TypeKind::WideString | TypeKind::Pointer | TypeKind::Callback
        )
    }

    pub fn is_aggregate(self) -> bool {
        matches!(self, TypeKind::Record | TypeKind::Array)
    }

    fn fixed_size(self) -> Option<usize> {
        match self {
            TypeKind::Void => Some(0),
            TypeKind::Bool | TypeKind::Int8 | TypeKind::UInt8 => Some(1),
            TypeKind::Int16 | TypeKind::UInt16 => Some(2),
            TypeKind::Int32 | TypeKind::UInt32 | TypeKind::Float32 => Some(4),
            TypeKind::Int64 | TypeKind::UInt64 | TypeKind::Float64 => Some(8),
            _ => None,
        }
    }
}

pub type DisposeFn = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RecordMember {
    pub name: String,
    pub ty: Arc<TypeDescriptor>,
    pub align: usize,
    pub offset: usize,
}

/// Member declaration accepted by [`TypeDescriptor::record_with`]; `align`
/// overrides the member type's natural alignment (1 packs the member).
#[derive(Clone, Debug)]
pub struct MemberSpec {
    pub name: String,
    pub ty: Arc<TypeDescriptor>,
    pub align: Option<usize>,
}

impl MemberSpec {
    pub fn new(name: impl Into<String>, ty: Arc<TypeDescriptor>) -> Self {
        Self {
            name: name.into(),
            ty,
            align: None,
        }
    }

    pub fn aligned(name: impl Into<String>, ty: Arc<TypeDescriptor>, align: usize) -> Self {
        Self {
            name: name.into(),
            ty,
            align: Some(align),
        }
    }
}

#[derive(Clone, Debug)]
pub enum TypeData {
    None,
    Record {
        name: String,
        members: Vec<RecordMember>,
    },
    Array {
        element: Arc<TypeDescriptor>,
        len: usize,
    },
    Pointer {
        pointee: Option<Arc<TypeDescriptor>>,
    },
    Callback {
        prototype: Arc<SignatureDescriptor>,
    },
}

#[derive(Clone)]
pub struct TypeDescriptor {
    kind: TypeKind,
    size: usize,
    align: usize,
    data: TypeData,
    dispose: Option<DisposeFn>,
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("data", &self.data)
            .field("dispose", &self.dispose.is_some())
            .finish()
    }
}

/// A scalar leaf of a flattened aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlatField {
    pub offset: usize,
    pub size: usize,
    pub kind: TypeKind,
}

macro_rules! scalar_constructors {
    ($($fn_name:ident => $kind:ident;)*) => {
        impl TypeDescriptor {
            $(
                pub fn $fn_name() -> Arc<TypeDescriptor> {
                    Arc::new(TypeDescriptor::leaf(TypeKind::$kind, HOST_POINTER_SIZE))
                }
            )*
        }
    };
}

scalar_constructors! {
    void => Void;
    bool => Bool;
    int8 => Int8;
    uint8 => UInt8;
    int16 => Int16;
    uint16 => UInt16;
    int32 => Int32;
    uint32 => UInt32;
    int64 => Int64;
    uint64 => UInt64;
    float32 => Float32;
    float64 => Float64;
    string => String;
    wide_string => WideString;
}

impl TypeDescriptor {
    fn leaf(kind: TypeKind, pointer_size: usize) -> Self {
        let size = kind.fixed_size().unwrap_or(pointer_size);
        let data = if kind == TypeKind::Pointer {
            TypeData::Pointer { pointee: None }
        } else {
            TypeData::None
        };
        Self {
            kind,
            size,
            align: size.max(1),
            data,
            dispose: None,
        }
    }

    /// Scalar or string descriptor for a target with the given pointer width.
    pub fn scalar_for(kind: TypeKind, pointer_size: usize) -> BridgeResult<Arc<Self>> {
        check_pointer_size(pointer_size)?;
        match kind {
            TypeKind::Record | TypeKind::Array | TypeKind::Callback => Err(
                BridgeError::unsupported(format!("{} is not a scalar kind", kind.name())),
            ),
            _ => Ok(Arc::new(Self::leaf(kind, pointer_size))),
        }
    }

    /// Opaque `void *`.
    pub fn opaque_pointer() -> Arc<Self> {
        Arc::new(Self::leaf(TypeKind::Pointer, HOST_POINTER_SIZE))
    }

    pub fn pointer(pointee: Arc<TypeDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            kind: TypeKind::Pointer,
            size: HOST_POINTER_SIZE,
            align: HOST_POINTER_SIZE,
            data: TypeData::Pointer {
                pointee: Some(pointee),
            },
            dispose: None,
        })
    }

    pub fn pointer_for(pointer_size: usize, pointee: Option<Arc<TypeDescriptor>>) -> BridgeResult<Arc<Self>> {
        check_pointer_size(pointer_size)?;
        Ok(Arc::new(Self {
            kind: TypeKind::Pointer,
            size: pointer_size,
            align: pointer_size,
            data: TypeData::Pointer { pointee },
            dispose: None,
        }))
    }

    pub fn record(
        name: impl Into<String>,
        members: Vec<(&str, Arc<TypeDescriptor>)>,
    ) -> BridgeResult<Arc<Self>> {
        let specs = members
            .into_iter()
            .map(|(member, ty)| MemberSpec::new(member, ty))
            .collect();
        Self::record_with(name, specs)
    }

    /// Record where every member is byte-aligned, like `#pragma pack(1)`.
    pub fn packed_record(
        name: impl Into<String>,
        members: Vec<(&str, Arc<TypeDescriptor>)>,
    ) -> BridgeResult<Arc<Self>> {
        let specs = members
            .into_iter()
            .map(|(member, ty)| MemberSpec::aligned(member, ty, 1))
            .collect();
        Self::record_with(name, specs)
    }

    pub fn record_with(name: impl Into<String>, members: Vec<MemberSpec>) -> BridgeResult<Arc<Self>> {
        let name = name.into();
        if members.is_empty() {
            return Err(BridgeError::unsupported(format!(
                "record '{name}' has no members"
            )));
        }

        let mut laid_out = Vec::with_capacity(members.len());
        let mut offset = 0usize;
        let mut record_align = 1usize;
        for member in members {
            if member.ty.kind == TypeKind::Void {
                return Err(BridgeError::unsupported(format!(
                    "record '{name}' member '{}' is Void",
                    member.name
                )));
            }
            if laid_out
                .iter()
                .any(|existing: &RecordMember| existing.name == member.name)
            {
                return Err(BridgeError::unsupported(format!(
                    "record '{name}' declares member '{}' twice",
                    member.name
                )));
            }
            let align = member.align.unwrap_or(member.ty.align);
            if !align.is_power_of_two() {
                return Err(BridgeError::unsupported(format!(
                    "record '{name}' member '{}' alignment {align} is not a power of two",
                    member.name
                )));
            }
            if align > MAX_ALIGN {
                return Err(BridgeError::unsupported(format!(
                    "record '{name}' member '{}' alignment {align} exceeds {MAX_ALIGN}",
                    member.name
                )));
            }
            offset = align_up(offset, align);
            record_align = record_align.max(align);
            laid_out.push(RecordMember {
                name: member.name,
                ty: member.ty.clone(),
                align,
                offset,
            });
            offset += member.ty.size;
        }

        Ok(Arc::new(Self {
            kind: TypeKind::Record,
            size: align_up(offset, record_align),
            align: record_align,
            data: TypeData::Record {
                name,
                members: laid_out,
            },
            dispose: None,
        }))
    }

    pub fn array(element: Arc<TypeDescriptor>, len: usize) -> BridgeResult<Arc<Self>> {
        if len == 0 || element.size == 0 {
            return Err(BridgeError::unsupported("arrays must have a non-zero size"));
        }
        Ok(Arc::new(Self {
            kind: TypeKind::Array,
            size: element.size * len,
            align: element.align,
            data: TypeData::Array { element, len },
            dispose: None,
        }))
    }

    /// Function pointer type; variadic prototypes cannot be exposed as callbacks.
    pub fn callback(prototype: Arc<SignatureDescriptor>) -> BridgeResult<Arc<Self>> {
        Self::callback_for(HOST_POINTER_SIZE, prototype)
    }

    pub fn callback_for(
        pointer_size: usize,
        prototype: Arc<SignatureDescriptor>,
    ) -> BridgeResult<Arc<Self>> {
        check_pointer_size(pointer_size)?;
        if prototype.variadic {
            return Err(BridgeError::unsupported(
                "variadic callback prototypes are not supported",
            ));
        }
        Ok(Arc::new(Self {
            kind: TypeKind::Callback,
            size: pointer_size,
            align: pointer_size,
            data: TypeData::Callback { prototype },
            dispose: None,
        }))
    }

    /// Copy of `ty` whose native values are handed to `dispose` once converted.
    pub fn with_dispose(ty: &TypeDescriptor, dispose: DisposeFn) -> Arc<Self> {
        let mut copy = ty.clone();
        copy.dispose = Some(dispose);
        Arc::new(copy)
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn data(&self) -> &TypeData {
        &self.data
    }

    pub fn dispose(&self) -> Option<&DisposeFn> {
        self.dispose.as_ref()
    }

    pub fn members(&self) -> &[RecordMember] {
        match &self.data {
            TypeData::Record { members, .. } => members,
            _ => &[],
        }
    }

    pub fn element(&self) -> Option<(&Arc<TypeDescriptor>, usize)> {
        match &self.data {
            TypeData::Array { element, len } => Some((element, *len)),
            _ => None,
        }
    }

    pub fn pointee(&self) -> Option<&Arc<TypeDescriptor>> {
        match &self.data {
            TypeData::Pointer { pointee } => pointee.as_ref(),
            _ => None,
        }
    }

    pub fn prototype(&self) -> Option<&Arc<SignatureDescriptor>> {
        match &self.data {
            TypeData::Callback { prototype } => Some(prototype),
            _ => None,
        }
    }

    /// Human readable type name used in diagnostics.
    pub fn describe(&self) -> String {
        match &self.data {
            TypeData::Record { name, .. } => format!("Record {name}"),
            TypeData::Array { element, len } => format!("{}[{len}]", element.describe()),
            TypeData::Pointer {
                pointee: Some(pointee),
            } => format!("Pointer<{}>", pointee.describe()),
            _ => self.kind.name().to_string(),
        }
    }

    /// Scalar leaves of this type in memory order.
    pub fn flatten(&self) -> Vec<FlatField> {
        let mut fields = Vec::new();
        self.flatten_into(0, &mut fields);
        fields
    }

    fn flatten_into(&self, base: usize, out: &mut Vec<FlatField>) {
        match &self.data {
            TypeData::Record { members, .. } => {
                for member in members {
                    member.ty.flatten_into(base + member.offset, out);
                }
            }
            TypeData::Array { element, len } => {
                for index in 0..*len {
                    element.flatten_into(base + index * element.size, out);
                }
            }
            _ if self.kind == TypeKind::Void => {}
            _ => out.push(FlatField {
                offset: base,
                size: self.size,
                kind: self.kind,
            }),
        }
    }

    /// Largest pointer-like leaf width found in this type, if any.
    pub(crate) fn pointer_width(&self) -> Option<usize> {
        self.flatten()
            .iter()
            .filter(|field| field.kind.is_pointer_like())
            .map(|field| field.size)
            .max()
    }

    pub(crate) fn has_unaligned_fields(&self) -> bool {
        self.flatten()
            .iter()
            .any(|field| field.size > 0 && field.offset % field.size.min(8) != 0)
    }
}

/// Float kind shared by every leaf of `ty` when it is a homogeneous
/// floating-point aggregate with `min_members..=max_members` leaves.
pub fn is_homogeneous_aggregate(
    ty: &TypeDescriptor,
    min_members: usize,
    max_members: usize,
) -> Option<TypeKind> {
    if !ty.kind.is_aggregate() {
        return None;
    }
    let fields = ty.flatten();
    let first = fields.first()?;
    if !first.kind.is_float() {
        return None;
    }
    if fields.len() < min_members || fields.len() > max_members {
        return None;
    }
    let contiguous = fields
        .iter()
        .enumerate()
        .all(|(index, field)| field.kind == first.kind && field.offset == index * first.size);
    if !contiguous || ty.size != fields.len() * first.size {
        return None;
    }
    Some(first.kind)
}

pub fn align_up(value: usize, align: usize) -> usize {
    let align = align.max(1);
    value.div_ceil(align) * align
}

fn check_pointer_size(pointer_size: usize) -> BridgeResult<()> {
    if pointer_size == 4 || pointer_size == 8 {
        Ok(())
    } else {
        Err(BridgeError::unsupported(format!(
            "pointer size {pointer_size} is neither 4 nor 8"
        )))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn copies_in(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn copies_out(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    #[default]
    Default,
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
}

impl CallingConvention {
    pub fn name(self) -> &'static str {
        match self {
            CallingConvention::Default => "default",
            CallingConvention::Cdecl => "cdecl",
            CallingConvention::Stdcall => "stdcall",
            CallingConvention::Fastcall => "fastcall",
            CallingConvention::Thiscall => "thiscall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParameterSlot {
    pub ty: Arc<TypeDescriptor>,
    pub direction: Direction,
    pub variadic: bool,
}

impl ParameterSlot {
    pub fn new(ty: Arc<TypeDescriptor>) -> Self {
        Self {
            ty,
            direction: Direction::In,
            variadic: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignatureDescriptor {
    name: Option<String>,
    parameters: Vec<ParameterSlot>,
    ret: ParameterSlot,
    convention: CallingConvention,
    variadic: bool,
}

impl SignatureDescriptor {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parameters(&self) -> &[ParameterSlot] {
        &self.parameters
    }

    pub fn ret(&self) -> &ParameterSlot {
        &self.ret
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// Parameters declared before the `...`.
    pub fn fixed_count(&self) -> usize {
        self.parameters.iter().filter(|slot| !slot.variadic).count()
    }

    /// Per-call signature with `extra` appended as variadic arguments after
    /// applying the C default argument promotions.
    pub fn with_variadic_args(
        &self,
        extra: &[Arc<TypeDescriptor>],
    ) -> BridgeResult<Arc<SignatureDescriptor>> {
        if !self.variadic {
            return Err(BridgeError::unsupported(
                "variadic arguments passed to a non-variadic signature",
            ));
        }
        let mut expanded = self.clone();
        expanded.parameters.retain(|slot| !slot.variadic);
        for ty in extra {
            let promoted = promote_variadic(ty)?;
            expanded.parameters.push(ParameterSlot {
                ty: promoted,
                direction: Direction::In,
                variadic: true,
            });
        }
        validate(&expanded)?;
        Ok(Arc::new(expanded))
    }
}

fn promote_variadic(ty: &Arc<TypeDescriptor>) -> BridgeResult<Arc<TypeDescriptor>> {
    let promoted = match ty.kind {
        TypeKind::Float32 => TypeDescriptor::float64(),
        TypeKind::Bool | TypeKind::Int8 | TypeKind::Int16 => TypeDescriptor::int32(),
        TypeKind::UInt8 | TypeKind::UInt16 => TypeDescriptor::uint32(),
        TypeKind::Void => {
            return Err(BridgeError::unsupported("variadic argument cannot be Void"));
        }
        _ => ty.clone(),
    };
    Ok(promoted)
}

fn validate(signature: &SignatureDescriptor) -> BridgeResult<()> {
    if signature.parameters.len() > MAX_PARAMETERS {
        return Err(BridgeError::unsupported(format!(
            "{} parameters exceed the limit of {MAX_PARAMETERS}",
            signature.parameters.len()
        )));
    }

    let mut out_count = 0usize;
    for (index, slot) in signature.parameters.iter().enumerate() {
        match slot.ty.kind {
            TypeKind::Void => {
                return Err(BridgeError::unsupported(format!(
                    "parameter {index} is Void"
                )));
            }
            TypeKind::Array => {
                return Err(BridgeError::unsupported(format!(
                    "parameter {index} is an array; pass it through a pointer"
                )));
            }
            _ => {}
        }
        if slot.direction != Direction::In {
            if slot.ty.kind != TypeKind::Pointer || slot.ty.pointee().is_none() {
                return Err(BridgeError::unsupported(format!(
                    "parameter {index} is {:?} but not a typed pointer",
                    slot.direction
                )));
            }
            out_count += 1;
        }
    }
    if out_count > MAX_OUT_PARAMETERS {
        return Err(BridgeError::unsupported(format!(
            "{out_count} output parameters exceed the limit of {MAX_OUT_PARAMETERS}"
        )));
    }

    if signature.ret.ty.kind == TypeKind::Array {
        return Err(BridgeError::unsupported("functions cannot return arrays"));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct SignatureBuilder {
    signature: SignatureDescriptor,
}

impl SignatureBuilder {
    pub fn new(ret: Arc<TypeDescriptor>) -> Self {
        Self {
            signature: SignatureDescriptor {
                name: None,
                parameters: Vec::new(),
                ret: ParameterSlot::new(ret),
                convention: CallingConvention::Default,
                variadic: false,
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.signature.name = Some(name.into());
        self
    }

    pub fn convention(mut self, convention: CallingConvention) -> Self {
        self.signature.convention = convention;
        self
    }

    pub fn param(mut self, ty: Arc<TypeDescriptor>) -> Self {
        self.signature.parameters.push(ParameterSlot::new(ty));
        self
    }

    pub fn param_with_direction(mut self, ty: Arc<TypeDescriptor>, direction: Direction) -> Self {
        self.signature.parameters.push(ParameterSlot {
            ty,
            direction,
            variadic: false,
        });
        self
    }

    pub fn variadic(mut self) -> Self {
        self.signature.variadic = true;
        self
    }

    pub fn build(self) -> BridgeResult<Arc<SignatureDescriptor>> {
        validate(&self.signature)?;
        Ok(Arc::new(self.signature))
    }
}
