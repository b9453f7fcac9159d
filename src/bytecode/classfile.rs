//! Minimal reader for compiled class files.
//!
//! Decodes the constant pool and the field table, which is all the
//! reinit classifier and the structural comparison need. Method bodies and
//! class-level attributes are never parsed.

use thiserror::Error;

const CLASS_MAGIC: u32 = 0xCAFE_BABE;

/// `ACC_STATIC` access flag.
pub const ACC_STATIC: u16 = 0x0008;
/// `ACC_FINAL` access flag.
pub const ACC_FINAL: u16 = 0x0010;

/// Failure to read a class blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassFileError {
    #[error("not a class file (magic {0:#010x})")]
    BadMagic(u32),

    #[error("class file truncated at offset {0}")]
    Truncated(usize),

    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownTag { tag: u8, index: u32 },

    #[error("constant pool index {0} does not hold the expected entry")]
    BadIndex(u16),
}

/// A compile-time constant attached to a field through `ConstantValue`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

/// One entry of a class's field table.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    /// JVM field descriptor, e.g. `I` or `Ljava/lang/String;`.
    pub descriptor: String,
    pub access_flags: u16,
    pub constant_value: Option<ConstantValue>,
}

impl FieldInfo {
    pub const fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    /// Fields are matched across versions by name and descriptor.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.name == other.name && self.descriptor == other.descriptor
    }
}

/// The parts of a class file this crate cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    /// Internal name, slash separated.
    pub this_class: String,
    pub super_class: Option<String>,
    pub fields: Vec<FieldInfo>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = Reader::new(bytes);

        let magic = reader.u32()?;
        if magic != CLASS_MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        reader.skip(4)?; // minor + major version

        let pool = ConstantPool::read(&mut reader)?;

        reader.skip(2)?; // access flags
        let this_class = pool.class_name(reader.u16()?)?.to_owned();
        let super_index = reader.u16()?;
        let super_class = if super_index == 0 {
            None
        } else {
            Some(pool.class_name(super_index)?.to_owned())
        };

        let interface_count = reader.u16()?;
        reader.skip(usize::from(interface_count) * 2)?;

        let field_count = reader.u16()?;
        let mut fields = Vec::with_capacity(usize::from(field_count));
        for _ in 0..field_count {
            let access_flags = reader.u16()?;
            let name = pool.utf8(reader.u16()?)?.to_owned();
            let descriptor = pool.utf8(reader.u16()?)?.to_owned();

            let mut constant_value = None;
            let attribute_count = reader.u16()?;
            for _ in 0..attribute_count {
                let attribute_name = pool.utf8(reader.u16()?)?;
                let length = reader.u32()? as usize;
                let body = reader.take(length)?;
                if attribute_name == "ConstantValue" && body.len() == 2 {
                    let index = u16::from_be_bytes([body[0], body[1]]);
                    constant_value = Some(pool.constant(index)?);
                }
            }

            fields.push(FieldInfo {
                name,
                descriptor,
                access_flags,
                constant_value,
            });
        }

        Ok(Self {
            this_class,
            super_class,
            fields,
        })
    }

    /// Dotted name, e.g. `com.example.Foo`.
    pub fn qualified_name(&self) -> String {
        self.this_class.replace('/', ".")
    }
}

enum PoolEntry {
    Utf8(String),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    Other,
    /// Slot 0 and the second slot of 8-byte constants.
    Unusable,
}

struct ConstantPool {
    entries: Vec<PoolEntry>,
}

impl ConstantPool {
    fn read(reader: &mut Reader<'_>) -> Result<Self, ClassFileError> {
        let count = u32::from(reader.u16()?);
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(PoolEntry::Unusable);

        let mut index = 1u32;
        while index < count {
            let tag = reader.u8()?;
            let entry = match tag {
                1 => {
                    let length = usize::from(reader.u16()?);
                    PoolEntry::Utf8(String::from_utf8_lossy(reader.take(length)?).into_owned())
                }
                3 => PoolEntry::Int(i32::from_be_bytes(reader.array()?)),
                4 => PoolEntry::Float(f32::from_bits(reader.u32()?)),
                5 => PoolEntry::Long(i64::from_be_bytes(reader.array()?)),
                6 => PoolEntry::Double(f64::from_bits(u64::from_be_bytes(reader.array()?))),
                7 => PoolEntry::Class(reader.u16()?),
                8 => PoolEntry::String(reader.u16()?),
                9 | 10 | 11 | 12 | 17 | 18 => {
                    reader.skip(4)?;
                    PoolEntry::Other
                }
                15 => {
                    reader.skip(3)?;
                    PoolEntry::Other
                }
                16 | 19 | 20 => {
                    reader.skip(2)?;
                    PoolEntry::Other
                }
                _ => return Err(ClassFileError::UnknownTag { tag, index }),
            };

            let wide = matches!(entry, PoolEntry::Long(_) | PoolEntry::Double(_));
            entries.push(entry);
            index += 1;
            if wide {
                entries.push(PoolEntry::Unusable);
                index += 1;
            }
        }

        Ok(Self { entries })
    }

    fn utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.entries.get(usize::from(index)) {
            Some(PoolEntry::Utf8(value)) => Ok(value),
            _ => Err(ClassFileError::BadIndex(index)),
        }
    }

    fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.entries.get(usize::from(index)) {
            Some(PoolEntry::Class(name_index)) => self.utf8(*name_index),
            _ => Err(ClassFileError::BadIndex(index)),
        }
    }

    fn constant(&self, index: u16) -> Result<ConstantValue, ClassFileError> {
        match self.entries.get(usize::from(index)) {
            Some(PoolEntry::Int(value)) => Ok(ConstantValue::Int(*value)),
            Some(PoolEntry::Long(value)) => Ok(ConstantValue::Long(*value)),
            Some(PoolEntry::Float(value)) => Ok(ConstantValue::Float(*value)),
            Some(PoolEntry::Double(value)) => Ok(ConstantValue::Double(*value)),
            Some(PoolEntry::String(utf8)) => Ok(ConstantValue::String(self.utf8(*utf8)?.to_owned())),
            _ => Err(ClassFileError::BadIndex(index)),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ClassFileError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), ClassFileError> {
        self.take(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ClassFileError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ClassFileError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ClassFileError> {
        Ok(u32::from_be_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::fixture::ClassBuilder;

    #[test]
    fn reads_fields_and_constants() {
        let bytes = ClassBuilder::new("com/example/Counter")
            .constant(ACC_STATIC | ACC_FINAL, "LIMIT", "I", ConstantValue::Int(99))
            .constant(ACC_STATIC | ACC_FINAL, "BIG", "J", ConstantValue::Long(1 << 40))
            .constant(
                ACC_STATIC | ACC_FINAL,
                "GREETING",
                "Ljava/lang/String;",
                ConstantValue::String("hi".into()),
            )
            .field(0, "count", "I")
            .build();

        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.this_class, "com/example/Counter");
        assert_eq!(class.qualified_name(), "com.example.Counter");
        assert_eq!(class.super_class.as_deref(), Some("java/lang/Object"));
        assert_eq!(class.fields.len(), 4);

        assert_eq!(class.fields[0].name, "LIMIT");
        assert!(class.fields[0].is_static());
        assert_eq!(class.fields[0].constant_value, Some(ConstantValue::Int(99)));
        // The long constant occupies two pool slots; the string after it must still resolve.
        assert_eq!(class.fields[1].constant_value, Some(ConstantValue::Long(1 << 40)));
        assert_eq!(
            class.fields[2].constant_value,
            Some(ConstantValue::String("hi".into()))
        );
        assert!(!class.fields[3].is_static());
        assert!(class.fields[3].constant_value.is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let err = ClassFile::parse(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, ClassFileError::BadMagic(0xDEAD_BEEF));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = ClassBuilder::new("A").field(0, "x", "I").build();
        let err = ClassFile::parse(&bytes[..bytes.len() - 6]).unwrap_err();
        assert!(matches!(err, ClassFileError::Truncated(_)));
    }

    #[test]
    fn same_shape_compares_name_and_descriptor() {
        let a = FieldInfo {
            name: "x".into(),
            descriptor: "I".into(),
            access_flags: 0,
            constant_value: None,
        };
        let b = FieldInfo {
            access_flags: ACC_STATIC,
            ..a.clone()
        };
        let c = FieldInfo {
            descriptor: "J".into(),
            ..a.clone()
        };
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
    }
}
