//! Static field reinitialization classification.
//!
//! Redefining a class does not re-run its static initializer, so a field
//! introduced by the new version would start out zeroed. A field can have its
//! value carried forward only when the value is a compile-time literal of a
//! primitive type. Everything else is reported as unsupported with a reason
//! specific enough to tell the user what to change.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::{ConstantValue, FieldInfo};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid field descriptor `{0}`")]
pub struct InvalidDescriptor(pub String);

/// A parsed JVM field descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Reference type; holds the internal class name.
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn parse(descriptor: &str) -> Result<Self, InvalidDescriptor> {
        let invalid = || InvalidDescriptor(descriptor.to_owned());
        let mut chars = descriptor.chars();
        let ty = match chars.next().ok_or_else(invalid)? {
            'B' => Self::Byte,
            'C' => Self::Char,
            'D' => Self::Double,
            'F' => Self::Float,
            'I' => Self::Int,
            'J' => Self::Long,
            'S' => Self::Short,
            'Z' => Self::Boolean,
            'L' => {
                let name = descriptor[1..].strip_suffix(';').ok_or_else(invalid)?;
                if name.is_empty() || name.contains(';') {
                    return Err(invalid());
                }
                return Ok(Self::Object(name.to_owned()));
            }
            '[' => {
                let component = Self::parse(&descriptor[1..]).map_err(|_| invalid())?;
                return Ok(Self::Array(Box::new(component)));
            }
            _ => return Err(invalid()),
        };
        if chars.next().is_some() {
            return Err(invalid());
        }
        Ok(ty)
    }

    pub fn descriptor(&self) -> String {
        match self {
            Self::Byte => "B".into(),
            Self::Char => "C".into(),
            Self::Double => "D".into(),
            Self::Float => "F".into(),
            Self::Int => "I".into(),
            Self::Long => "J".into(),
            Self::Short => "S".into(),
            Self::Boolean => "Z".into(),
            Self::Object(name) => format!("L{name};"),
            Self::Array(component) => format!("[{}", component.descriptor()),
        }
    }

    pub const fn is_primitive(&self) -> bool {
        !matches!(self, Self::Object(_) | Self::Array(_))
    }

    /// Render a pool constant as a literal of this type.
    ///
    /// Returns `None` when the constant does not fit the type, which the
    /// classifier treats as "not a constant".
    pub fn render(&self, value: &ConstantValue) -> Option<String> {
        match (self, value) {
            (Self::Boolean, ConstantValue::Int(0)) => Some("false".into()),
            (Self::Boolean, ConstantValue::Int(1)) => Some("true".into()),
            (Self::Char, ConstantValue::Int(v)) => u16::try_from(*v)
                .ok()
                .and_then(|unit| char::from_u32(u32::from(unit)))
                .map(String::from),
            (Self::Byte, ConstantValue::Int(v)) => i8::try_from(*v).ok().map(|v| v.to_string()),
            (Self::Short, ConstantValue::Int(v)) => i16::try_from(*v).ok().map(|v| v.to_string()),
            (Self::Int, ConstantValue::Int(v)) => Some(v.to_string()),
            (Self::Long, ConstantValue::Long(v)) => Some(v.to_string()),
            (Self::Float, ConstantValue::Float(v)) => Some(v.to_string()),
            (Self::Double, ConstantValue::Double(v)) => Some(v.to_string()),
            _ => None,
        }
    }

    /// Whether `text` is a valid literal of this type for a live literal update.
    ///
    /// Strings are accepted in addition to primitives since literal holders
    /// store them directly.
    pub fn accepts_literal(&self, text: &str) -> bool {
        match self {
            Self::Boolean => matches!(text, "true" | "false"),
            Self::Char => text.chars().count() == 1,
            Self::Byte => text.parse::<i8>().is_ok(),
            Self::Short => text.parse::<i16>().is_ok(),
            Self::Int => text.parse::<i32>().is_ok(),
            Self::Long => text.parse::<i64>().is_ok(),
            Self::Float => text.parse::<f32>().is_ok(),
            Self::Double => text.parse::<f64>().is_ok(),
            Self::Object(name) => name == "java/lang/String",
            Self::Array(_) => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

/// Why a field's value cannot be carried across a redefinition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedReinit {
    /// Instance field: existing objects have no slot to initialize.
    NonStatic,
    /// Static primitive whose value is computed at class initialization.
    StaticNotConstant,
    /// Static field of reference type.
    StaticObject,
    /// Static field of array type.
    StaticArray,
}

impl fmt::Display for UnsupportedReinit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NonStatic => "non-static field",
            Self::StaticNotConstant => "static field without a constant value",
            Self::StaticObject => "static object field",
            Self::StaticArray => "static array field",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ReinitClassification {
    CarryForwardSafe,
    Unsupported(UnsupportedReinit),
}

impl ReinitClassification {
    pub const fn is_safe(self) -> bool {
        matches!(self, Self::CarryForwardSafe)
    }
}

/// Classify one field. Anything not provably a primitive literal is unsupported.
pub fn classify(field: &FieldInfo) -> ReinitClassification {
    use ReinitClassification::{CarryForwardSafe, Unsupported};

    if !field.is_static() {
        return Unsupported(UnsupportedReinit::NonStatic);
    }
    let Ok(ty) = FieldType::parse(&field.descriptor) else {
        return Unsupported(UnsupportedReinit::StaticNotConstant);
    };
    match ty {
        FieldType::Array(_) => Unsupported(UnsupportedReinit::StaticArray),
        FieldType::Object(_) => Unsupported(UnsupportedReinit::StaticObject),
        primitive => match field.constant_value.as_ref().and_then(|v| primitive.render(v)) {
            Some(_) => CarryForwardSafe,
            None => Unsupported(UnsupportedReinit::StaticNotConstant),
        },
    }
}

/// Reinit instruction for one field of a redefined class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldReinitEntry {
    pub field_name: String,
    /// Field descriptor as declared in the class file.
    pub declared_type: String,
    pub is_static: bool,
    /// Rendered literal, present only for carry-forward-safe fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal_value: Option<String>,
    pub classification: ReinitClassification,
}

impl FieldReinitEntry {
    pub fn from_field(field: &FieldInfo) -> Self {
        let classification = classify(field);
        let literal_value = if classification.is_safe() {
            FieldType::parse(&field.descriptor)
                .ok()
                .zip(field.constant_value.as_ref())
                .and_then(|(ty, value)| ty.render(value))
        } else {
            None
        };
        Self {
            field_name: field.name.clone(),
            declared_type: field.descriptor.clone(),
            is_static: field.is_static(),
            literal_value,
            classification,
        }
    }
}

/// Entries for the fields the new class version introduces.
///
/// Fields present in both versions keep their live values and need no
/// instruction.
pub fn reinit_entries(old_fields: &[FieldInfo], new_fields: &[FieldInfo]) -> Vec<FieldReinitEntry> {
    new_fields
        .iter()
        .filter(|field| !old_fields.iter().any(|old| old.same_shape(field)))
        .map(FieldReinitEntry::from_field)
        .collect()
}
