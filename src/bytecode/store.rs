//! Ordered container for one build's compiled classes.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// SHA-256 of a class blob, serialized as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn of(code: &[u8]) -> Self {
        Self(Sha256::digest(code).into())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.to_string()
    }
}

impl TryFrom<String> for Checksum {
    type Error = hex::FromHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(value, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// A class as it sits in the build output. Always holds its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClass {
    /// Dotted qualified name, unique within a build.
    pub name: String,
    pub checksum: Checksum,
    pub code: Vec<u8>,
}

/// A class as emitted by the delta engine.
///
/// `code` is present only when the class was classified as changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassBytecodeUnit {
    pub name: String,
    pub checksum: Checksum,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::bytecode::base64_blob::option"
    )]
    pub code: Option<Vec<u8>>,
}

impl ClassBytecodeUnit {
    pub const fn is_changed(&self) -> bool {
        self.code.is_some()
    }
}

/// One build's compiled classes in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ClassStore {
    classes: Vec<StoredClass>,
    index: HashMap<String, usize>,
}

impl ClassStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class blob, computing its checksum.
    pub fn insert(&mut self, name: impl Into<String>, code: Vec<u8>) -> Result<&StoredClass> {
        let name = name.into();
        anyhow::ensure!(
            !self.index.contains_key(&name),
            "Duplicate class in build output: {name}"
        );

        let position = self.classes.len();
        self.index.insert(name.clone(), position);
        self.classes.push(StoredClass {
            name,
            checksum: Checksum::of(&code),
            code,
        });
        Ok(&self.classes[position])
    }

    /// Load every `*.class` file under `root`.
    ///
    /// The qualified name is the path relative to `root` with separators
    /// replaced by dots. Files are visited in sorted path order so two loads
    /// of the same tree produce the same store.
    pub fn from_dir(root: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        collect_class_files(root, &mut paths)?;
        paths.sort();

        let mut store = Self::new();
        for path in paths {
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
            let name = relative
                .with_extension("")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(".");
            let code = std::fs::read(&path)
                .with_context(|| format!("Failed to read class file {}", path.display()))?;
            store.insert(name, code)?;
        }

        debug!(root = %root.display(), classes = store.len(), "Loaded build output");
        Ok(store)
    }

    pub fn get(&self, name: &str) -> Option<&StoredClass> {
        self.index.get(name).map(|&i| &self.classes[i])
    }

    pub fn checksum(&self, name: &str) -> Option<Checksum> {
        self.get(name).map(|class| class.checksum)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StoredClass> {
        self.classes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|class| class.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

fn collect_class_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read build output directory {}", dir.display()))?;

    for entry in entries {
        let path = entry
            .with_context(|| format!("Error reading entry in {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_class_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "class") {
            out.push(path);
        }
    }
    Ok(())
}
