//! Builds small but valid class files for tests.
//!
//! Compiled into the library for its own unit tests and, with the
//! `test-utils` feature, for integration tests.

use super::classfile::ConstantValue;

struct FieldSpec {
    access: u16,
    name: String,
    descriptor: String,
    constant: Option<ConstantValue>,
}

/// Writes a class with the given fields, no methods and no interfaces.
pub struct ClassBuilder {
    name: String,
    fields: Vec<FieldSpec>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, access: u16, name: &str, descriptor: &str) -> Self {
        self.fields.push(FieldSpec {
            access,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            constant: None,
        });
        self
    }

    /// Add a field carrying a `ConstantValue` attribute.
    #[must_use]
    pub fn constant(
        mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        value: ConstantValue,
    ) -> Self {
        self.fields.push(FieldSpec {
            access,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            constant: Some(value),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut pool = Pool::default();
        let this_class = pool.class(&self.name);
        let super_class = pool.class("java/lang/Object");
        let constant_value_attr = pool.utf8("ConstantValue");

        let mut fields = Vec::new();
        for field in &self.fields {
            fields.extend_from_slice(&field.access.to_be_bytes());
            fields.extend_from_slice(&pool.utf8(&field.name).to_be_bytes());
            fields.extend_from_slice(&pool.utf8(&field.descriptor).to_be_bytes());
            match &field.constant {
                Some(value) => {
                    let index = pool.constant(value);
                    fields.extend_from_slice(&1u16.to_be_bytes());
                    fields.extend_from_slice(&constant_value_attr.to_be_bytes());
                    fields.extend_from_slice(&2u32.to_be_bytes());
                    fields.extend_from_slice(&index.to_be_bytes());
                }
                None => fields.extend_from_slice(&0u16.to_be_bytes()),
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&pool.next.to_be_bytes());
        out.extend_from_slice(&pool.bytes);
        out.extend_from_slice(&0x0021u16.to_be_bytes());
        out.extend_from_slice(&this_class.to_be_bytes());
        out.extend_from_slice(&super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // interfaces
        out.extend_from_slice(&u16::try_from(self.fields.len()).expect("too many fields").to_be_bytes());
        out.extend_from_slice(&fields);
        out.extend_from_slice(&0u16.to_be_bytes()); // methods
        out.extend_from_slice(&0u16.to_be_bytes()); // attributes
        out
    }
}

struct Pool {
    bytes: Vec<u8>,
    next: u16,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            bytes: Vec::new(),
            next: 1,
        }
    }
}

impl Pool {
    fn push(&mut self, tag: u8, body: &[u8], slots: u16) -> u16 {
        let index = self.next;
        self.bytes.push(tag);
        self.bytes.extend_from_slice(body);
        self.next += slots;
        index
    }

    fn utf8(&mut self, value: &str) -> u16 {
        let mut body = u16::try_from(value.len()).expect("utf8 constant too long").to_be_bytes().to_vec();
        body.extend_from_slice(value.as_bytes());
        self.push(1, &body, 1)
    }

    fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.push(7, &name_index.to_be_bytes(), 1)
    }

    fn constant(&mut self, value: &ConstantValue) -> u16 {
        match value {
            ConstantValue::Int(v) => self.push(3, &v.to_be_bytes(), 1),
            ConstantValue::Float(v) => self.push(4, &v.to_bits().to_be_bytes(), 1),
            ConstantValue::Long(v) => self.push(5, &v.to_be_bytes(), 2),
            ConstantValue::Double(v) => self.push(6, &v.to_bits().to_be_bytes(), 2),
            ConstantValue::String(v) => {
                let utf8 = self.utf8(v);
                self.push(8, &utf8.to_be_bytes(), 1)
            }
        }
    }
}
