//! Update request types and the builder that assembles them.
//!
//! A request is exactly one of three shapes. Class swaps carry redefined and
//! newly introduced classes; live edits carry a single recompiled class;
//! literal updates carry values only and never any bytecode.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::bytecode::{ClassBytecodeUnit, ClassFile, ClassFileError, ClassStore, StoredClass};
use crate::delta;
use crate::reinit::{self, FieldReinitEntry, FieldType};

/// A versioned update destined for one application's agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateRequest {
    ClassSwap(ClassSwapRequest),
    LiveEdit(LiveEditRequest),
    LiveLiteralUpdate(LiveLiteralUpdateRequest),
}

impl UpdateRequest {
    pub fn package_name(&self) -> &str {
        match self {
            Self::ClassSwap(req) => &req.package_name,
            Self::LiveEdit(req) => &req.package_name,
            Self::LiveLiteralUpdate(req) => &req.package_name,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ClassSwap(_) => "class_swap",
            Self::LiveEdit(_) => "live_edit",
            Self::LiveLiteralUpdate(_) => "live_literal_update",
        }
    }
}

impl From<ClassSwapRequest> for UpdateRequest {
    fn from(req: ClassSwapRequest) -> Self {
        Self::ClassSwap(req)
    }
}

impl From<LiveEditRequest> for UpdateRequest {
    fn from(req: LiveEditRequest) -> Self {
        Self::LiveEdit(req)
    }
}

impl From<LiveLiteralUpdateRequest> for UpdateRequest {
    fn from(req: LiveLiteralUpdateRequest) -> Self {
        Self::LiveLiteralUpdate(req)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSwapRequest {
    pub package_name: String,
    pub restart_activity_on_apply: bool,
    pub allow_structural_redefinition: bool,
    pub allow_variable_reinit: bool,
    pub modified_classes: Vec<ModifiedClass>,
    pub new_classes: Vec<ClassBytecodeUnit>,
}

/// A redefined class plus the reinit instructions for fields it introduces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedClass {
    pub unit: ClassBytecodeUnit,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reinit: Vec<FieldReinitEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEditRequest {
    pub package_name: String,
    pub target_class_name: String,
    pub is_composable_body: bool,
    pub source_start_offset: u32,
    pub source_end_offset: u32,
    /// Recompiled bytecode of the target class.
    #[serde(with = "crate::bytecode::base64_blob")]
    pub class_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveLiteralUpdateRequest {
    pub package_name: String,
    pub updates: Vec<LiteralUpdate>,
}

/// New value for a compiler-synthesized literal holder, addressed by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralUpdate {
    pub helper_class_name: String,
    pub source_offset: u32,
    /// Field descriptor of the literal, e.g. `I` or `Ljava/lang/String;`.
    pub declared_type: String,
    pub literal_value: String,
}

/// Caller-supplied deployment flags for a class swap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapOptions {
    pub restart_activity_on_apply: bool,
    pub allow_structural_redefinition: bool,
    pub allow_variable_reinit: bool,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no classes changed since the previous deployment")]
    NoChanges,

    #[error("cannot read fields of {class}: {source}")]
    ClassFile {
        class: String,
        #[source]
        source: ClassFileError,
    },

    #[error("source offsets are reversed: start {start} > end {end}")]
    InvalidOffsets { start: u32, end: u32 },

    #[error("literal update contains no values")]
    EmptyLiteralUpdate,

    #[error("`{value}` is not a valid literal of type {declared_type}")]
    InvalidLiteral { declared_type: String, value: String },
}

/// A class swap request plus what the swap cannot express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSwapPlan {
    pub request: ClassSwapRequest,
    /// Classes deleted since the previous deployment. Loaded classes cannot be
    /// unloaded, so these are reported to the caller rather than sent.
    pub removed_classes: Vec<String>,
}

/// Build a class swap from the current build and the previously deployed
/// snapshot.
#[instrument(skip(current, previous), fields(current = current.len(), previous = previous.len()))]
pub fn build_class_swap(
    package_name: &str,
    current: &ClassStore,
    previous: &ClassStore,
    options: SwapOptions,
) -> Result<ClassSwapPlan, BuildError> {
    let mut modified_classes = Vec::new();
    let mut new_classes = Vec::new();

    for unit in delta::diff_against(current, previous) {
        if !unit.is_changed() {
            continue;
        }
        match previous.get(&unit.name) {
            Some(before) => {
                let reinit = if options.allow_variable_reinit {
                    added_field_entries(&unit, before)?
                } else {
                    Vec::new()
                };
                modified_classes.push(ModifiedClass { unit, reinit });
            }
            None => new_classes.push(unit),
        }
    }

    if modified_classes.is_empty() && new_classes.is_empty() {
        return Err(BuildError::NoChanges);
    }

    let removed_classes = delta::removed_classes(current, previous);
    if !removed_classes.is_empty() {
        warn!(removed = ?removed_classes, "Removed classes stay loaded in the running process");
    }

    debug!(
        modified = modified_classes.len(),
        added = new_classes.len(),
        "Built class swap request"
    );

    Ok(ClassSwapPlan {
        request: ClassSwapRequest {
            package_name: package_name.to_owned(),
            restart_activity_on_apply: options.restart_activity_on_apply,
            allow_structural_redefinition: options.allow_structural_redefinition,
            allow_variable_reinit: options.allow_variable_reinit,
            modified_classes,
            new_classes,
        },
        removed_classes,
    })
}

fn added_field_entries(
    unit: &ClassBytecodeUnit,
    before: &StoredClass,
) -> Result<Vec<FieldReinitEntry>, BuildError> {
    let read = |name: &str, code: &[u8]| {
        ClassFile::parse(code).map_err(|source| BuildError::ClassFile {
            class: name.to_owned(),
            source,
        })
    };
    let old = read(&before.name, &before.code)?;
    let new = read(&unit.name, unit.code.as_deref().unwrap_or_default())?;
    Ok(reinit::reinit_entries(&old.fields, &new.fields))
}

/// Build a live edit for one recompiled class.
pub fn build_live_edit(
    package_name: &str,
    class: &StoredClass,
    is_composable_body: bool,
    source_start_offset: u32,
    source_end_offset: u32,
) -> Result<LiveEditRequest, BuildError> {
    if source_start_offset > source_end_offset {
        return Err(BuildError::InvalidOffsets {
            start: source_start_offset,
            end: source_end_offset,
        });
    }
    Ok(LiveEditRequest {
        package_name: package_name.to_owned(),
        target_class_name: class.name.clone(),
        is_composable_body,
        source_start_offset,
        source_end_offset,
        class_data: class.code.clone(),
    })
}

/// Build a literal update, checking every value against its declared type.
pub fn build_literal_update(
    package_name: &str,
    updates: Vec<LiteralUpdate>,
) -> Result<LiveLiteralUpdateRequest, BuildError> {
    if updates.is_empty() {
        return Err(BuildError::EmptyLiteralUpdate);
    }
    for update in &updates {
        let accepted = FieldType::parse(&update.declared_type)
            .is_ok_and(|ty| ty.accepts_literal(&update.literal_value));
        if !accepted {
            return Err(BuildError::InvalidLiteral {
                declared_type: update.declared_type.clone(),
                value: update.literal_value.clone(),
            });
        }
    }
    Ok(LiveLiteralUpdateRequest {
        package_name: package_name.to_owned(),
        updates,
    })
}
