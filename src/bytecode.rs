//! Compiled class storage.
//!
//! A build's output is held as an ordered [`ClassStore`] of named class
//! blobs. The class file reader only looks at field tables; everything
//! else about the bytecode is treated as opaque.

pub mod classfile;
mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod fixture;

pub use classfile::{ClassFile, ClassFileError, ConstantValue, FieldInfo};
pub use store::{Checksum, ClassBytecodeUnit, ClassStore, StoredClass};

/// Serde adapter carrying class blobs as base64 strings inside JSON.
pub(crate) mod base64_blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::STANDARD;
        use base64::Engine as _;
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
