//! Shared data model: node identity, register metadata, and the wire-value
//! envelope that travels from the native client through the subscription
//! manager into accessors.

use std::fmt;

use opcua::types::{StatusCode, Variant};

/// Identity of an OPC UA variable. Equality is structural and this is the
/// key used to de-duplicate monitored items and catalogue entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeId {
    Numeric { namespace: u16, id: u32 },
    String { namespace: u16, id: String },
}

impl NodeId {
    pub fn namespace(&self) -> u16 {
        match self {
            NodeId::Numeric { namespace, .. } => *namespace,
            NodeId::String { namespace, .. } => *namespace,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Numeric { namespace, id } => write!(f, "ns={namespace};i={id}"),
            NodeId::String { namespace, id } => write!(f, "ns={namespace};s={id}"),
        }
    }
}

/// Wire type code for the twelve supported OPC UA scalar primitives.
/// Numeric values match the persisted cache/mapfile `typeId` table in
/// spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Bool = 1,
    I8 = 2,
    U8 = 3,
    I16 = 4,
    U16 = 5,
    I32 = 6,
    U32 = 7,
    I64 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    String = 12,
}

impl TypeCode {
    /// Map from the OPC UA `BuiltinId` numeric data type attribute. Unknown
    /// ids return `None` so the caller can skip the register with a warning
    /// (spec.md §4.3: "unknown typecodes cause the register to be silently
    /// skipped with a warning").
    pub fn from_builtin_id(id: u32) -> Option<Self> {
        Some(match id {
            1 => TypeCode::Bool,
            2 => TypeCode::I8,
            3 => TypeCode::U8,
            4 => TypeCode::I16,
            5 => TypeCode::U16,
            6 => TypeCode::I32,
            7 => TypeCode::U32,
            8 => TypeCode::I64,
            9 => TypeCode::U64,
            10 => TypeCode::F32,
            11 => TypeCode::F64,
            12 => TypeCode::String,
            _ => return None,
        })
    }

    pub fn as_cache_id(self) -> u32 {
        self as u32
    }
}

/// Fundamental shape of a register's data, used by consumers of the
/// catalogue to decide how to format/parse values without knowing the wire
/// type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundamentalType {
    Boolean,
    Numeric,
    String,
}

/// Describes the numeric/string shape of a register's data. Grounded on
/// `original_source/src/RegisterInfo.cc`'s `addProperty` typecode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub fundamental_type: FundamentalType,
    pub signed: bool,
    pub integer: bool,
    pub decimal_digits: usize,
}

impl DataDescriptor {
    /// Maximum number of decimal digits to display an `f32` without loss in
    /// non-exponential form: sign, leading zero, decimal dot, and one extra
    /// digit to avoid rounding issues.
    fn float_max_digits() -> usize {
        let a = (f32::MAX as f64).log10();
        let b = -(f32::MIN_POSITIVE as f64).log10();
        (a.max(b) as usize) + 4
    }

    pub fn for_type_code(code: TypeCode) -> Self {
        use FundamentalType::*;
        match code {
            TypeCode::Bool => DataDescriptor { fundamental_type: Boolean, signed: true, integer: true, decimal_digits: 320 },
            TypeCode::I8 => DataDescriptor { fundamental_type: Numeric, signed: true, integer: true, decimal_digits: 4 },
            TypeCode::U8 => DataDescriptor { fundamental_type: Numeric, signed: false, integer: true, decimal_digits: 3 },
            TypeCode::I16 => DataDescriptor { fundamental_type: Numeric, signed: true, integer: true, decimal_digits: 5 },
            TypeCode::U16 => DataDescriptor { fundamental_type: Numeric, signed: false, integer: true, decimal_digits: 6 },
            TypeCode::I32 => DataDescriptor { fundamental_type: Numeric, signed: true, integer: true, decimal_digits: 10 },
            TypeCode::U32 => DataDescriptor { fundamental_type: Numeric, signed: false, integer: true, decimal_digits: 11 },
            TypeCode::I64 => DataDescriptor { fundamental_type: Numeric, signed: true, integer: true, decimal_digits: 320 },
            TypeCode::U64 => DataDescriptor { fundamental_type: Numeric, signed: false, integer: true, decimal_digits: 320 },
            TypeCode::F32 => DataDescriptor { fundamental_type: Numeric, signed: true, integer: false, decimal_digits: Self::float_max_digits() },
            TypeCode::F64 => DataDescriptor { fundamental_type: Numeric, signed: true, integer: false, decimal_digits: 300 },
            TypeCode::String => DataDescriptor { fundamental_type: String, signed: true, integer: true, decimal_digits: 320 },
        }
    }
}

/// Access modes a register supports. Every register reports
/// `wait_for_new_data` (spec.md §4.3); `raw` is never set (forbidden at
/// accessor construction, spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessModeFlags {
    pub wait_for_new_data: bool,
    pub raw: bool,
}

/// Register metadata, immutable once built. Owned by the catalogue;
/// accessors hold an `Arc` borrow.
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub path: String,
    pub node_id: NodeId,
    pub browse_name: String,
    pub type_code: TypeCode,
    pub array_length: usize,
    pub read_only: bool,
    /// Optional "a:b" sub-range string applied to subscriptions and reads.
    pub index_range: Option<String>,
    pub description: String,
    pub access_modes: AccessModeFlags,
    pub data_descriptor: DataDescriptor,
}

impl RegisterInfo {
    pub fn is_readable(&self) -> bool {
        true
    }

    pub fn is_writeable(&self) -> bool {
        !self.read_only
    }
}

/// A value read from, or about to be written to, the wire, together with
/// the metadata needed to give it a version and judge its validity.
///
/// `original_source` passes `UA_DataValue` around by value and documents an
/// explicit "release obligation" transferred on move; in Rust that transfer
/// is just ownership, so no manual clear-on-move flag is needed. The one
/// place the original *copies* rather than moves (fanning a single
/// publish-loop notification out to every accessor subscribed to the same
/// node) is modeled explicitly with [`DataValue::deep_clone`].
#[derive(Debug, Clone)]
pub struct DataValue {
    pub variant: Variant,
    /// Raw OPC UA source timestamp (100ns ticks since 1601-01-01).
    pub source_timestamp: i64,
    pub status: StatusCode,
    pub has_value: bool,
}

impl DataValue {
    pub fn empty() -> Self {
        DataValue {
            variant: Variant::Empty,
            source_timestamp: 0,
            status: StatusCode::BadWaitingForInitialData,
            has_value: false,
        }
    }

    pub fn is_good(&self) -> bool {
        self.has_value && self.status.is_good()
    }

    /// Explicit deep copy used at fan-out points (one publish notification
    /// delivered to N accessors sharing a monitored item).
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }
}
