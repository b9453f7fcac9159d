//! Reference [`Redefiner`] over an in-memory class table.
//!
//! Tracks what a real runtime would: which classes are loaded, their current
//! checksum and field table, carried static values, and live literal values.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::Redefiner;
use crate::bytecode::{Checksum, ClassBytecodeUnit, ClassFile, ClassStore, FieldInfo};
use crate::outcome::{AgentOutcome, AgentStatus, DetailKind, OutcomeDetail};
use crate::reinit::{FieldType, ReinitClassification};
use crate::request::{ClassSwapRequest, LiveEditRequest, LiveLiteralUpdateRequest};

#[derive(Debug, Clone)]
struct LoadedClass {
    checksum: Checksum,
    fields: Vec<FieldInfo>,
    /// Static values carried in by reinit, keyed by field name.
    statics: HashMap<String, String>,
}

impl LoadedClass {
    fn parse(code: &[u8]) -> Result<Self, String> {
        let class = ClassFile::parse(code).map_err(|e| e.to_string())?;
        Ok(Self {
            checksum: Checksum::of(code),
            fields: class.fields,
            statics: HashMap::new(),
        })
    }
}

/// A live edit the runtime accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEditRecord {
    pub class_name: String,
    pub is_composable_body: bool,
    pub source_start_offset: u32,
    pub source_end_offset: u32,
}

#[derive(Debug, Default)]
struct State {
    classes: HashMap<String, LoadedClass>,
    literals: HashMap<(String, u32), String>,
    live_edits: Vec<LiveEditRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a class as if the process had started with it.
    pub fn load(&self, name: &str, code: &[u8]) -> Result<()> {
        let loaded = LoadedClass::parse(code)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Failed to load {name}"))?;
        self.lock().classes.insert(name.to_owned(), loaded);
        Ok(())
    }

    /// Load every class of a build.
    pub fn load_store(&self, store: &ClassStore) -> Result<()> {
        for class in store.iter() {
            self.load(&class.name, &class.code)?;
        }
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.lock().classes.contains_key(name)
    }

    pub fn checksum(&self, name: &str) -> Option<Checksum> {
        self.lock().classes.get(name).map(|c| c.checksum)
    }

    pub fn field_names(&self, name: &str) -> Option<Vec<String>> {
        self.lock()
            .classes
            .get(name)
            .map(|c| c.fields.iter().map(|f| f.name.clone()).collect())
    }

    /// Value a reinit entry carried into a static field.
    pub fn static_value(&self, class: &str, field: &str) -> Option<String> {
        self.lock().classes.get(class)?.statics.get(field).cloned()
    }

    pub fn literal(&self, helper_class: &str, offset: u32) -> Option<String> {
        self.lock()
            .literals
            .get(&(helper_class.to_owned(), offset))
            .cloned()
    }

    pub fn live_edits(&self) -> Vec<LiveEditRecord> {
        self.lock().live_edits.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removed fields first, then added ones, each in declaration order.
fn field_changes(class_name: &str, old: &[FieldInfo], new: &[FieldInfo]) -> Vec<OutcomeDetail> {
    let missing_from = |fields: &[FieldInfo], field: &FieldInfo| !fields.iter().any(|f| f.same_shape(field));

    let removed = old
        .iter()
        .filter(|&f| missing_from(new, f))
        .map(|f| OutcomeDetail::field(class_name, &f.name, DetailKind::FieldRemoved));
    let added = new
        .iter()
        .filter(|&f| missing_from(old, f))
        .map(|f| OutcomeDetail::field(class_name, &f.name, DetailKind::FieldAdded));
    removed.chain(added).collect()
}

fn unit_code(unit: &ClassBytecodeUnit) -> Result<&[u8], AgentOutcome> {
    unit.code.as_deref().ok_or_else(|| {
        AgentOutcome::failure(
            AgentStatus::RedefinitionFailed,
            format!("{} carries no bytecode", unit.name),
        )
    })
}

impl Redefiner for InMemoryRuntime {
    fn swap(&self, request: &ClassSwapRequest) -> AgentOutcome {
        let mut state = self.lock();

        // Validate everything before touching the class table.
        let mut staged = Vec::new();
        let mut details = Vec::new();
        let mut reinit_failure = None;

        for modified in &request.modified_classes {
            let name = &modified.unit.name;
            let Some(current) = state.classes.get(name) else {
                warn!(class = %name, "Class to redefine is not loaded");
                return AgentOutcome::failure(AgentStatus::ClassNotFound, name.clone());
            };
            let code = match unit_code(&modified.unit) {
                Ok(code) => code,
                Err(outcome) => return outcome,
            };
            let mut next = match LoadedClass::parse(code) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return AgentOutcome::failure(AgentStatus::RedefinitionFailed, format!("{name}: {e}"))
                }
            };

            details.extend(field_changes(name, &current.fields, &next.fields));

            // Retained statics keep their live values.
            next.statics = current
                .statics
                .iter()
                .filter(|(field, _)| next.fields.iter().any(|f| &f.name == *field))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            if request.allow_variable_reinit {
                for entry in &modified.reinit {
                    match (entry.classification, &entry.literal_value) {
                        (ReinitClassification::CarryForwardSafe, Some(value)) => {
                            next.statics.insert(entry.field_name.clone(), value.clone());
                        }
                        (ReinitClassification::Unsupported(reason), _) => {
                            reinit_failure
                                .get_or_insert_with(|| (reason, format!("{name}.{}", entry.field_name)));
                        }
                        (ReinitClassification::CarryForwardSafe, None) => {}
                    }
                }
            }
            staged.push((name.clone(), next));
        }

        if !details.is_empty() && !request.allow_structural_redefinition {
            warn!(changes = details.len(), "Swap rejected: class shapes differ");
            return AgentOutcome::structural_mismatch(details);
        }
        if let Some((reason, field)) = reinit_failure {
            warn!(field = %field, %reason, "Swap rejected: field cannot be reinitialized");
            return AgentOutcome::failure(AgentStatus::UnsupportedReinit { reason }, field);
        }

        for unit in &request.new_classes {
            let code = match unit_code(unit) {
                Ok(code) => code,
                Err(outcome) => return outcome,
            };
            match LoadedClass::parse(code) {
                Ok(loaded) => staged.push((unit.name.clone(), loaded)),
                Err(e) => {
                    return AgentOutcome::failure(
                        AgentStatus::RedefinitionFailed,
                        format!("{}: {e}", unit.name),
                    )
                }
            }
        }

        let count = staged.len();
        for (name, class) in staged {
            state.classes.insert(name, class);
        }
        info!(classes = count, package = %request.package_name, "Swap applied");
        AgentOutcome::ok()
    }

    fn live_edit(&self, request: &LiveEditRequest) -> AgentOutcome {
        let mut state = self.lock();
        let name = &request.target_class_name;

        let Some(current) = state.classes.get_mut(name) else {
            return AgentOutcome::failure(AgentStatus::ClassNotFound, name.clone());
        };
        let next = match LoadedClass::parse(&request.class_data) {
            Ok(next) => next,
            Err(e) => return AgentOutcome::failure(AgentStatus::RedefinitionFailed, format!("{name}: {e}")),
        };

        let details = field_changes(name, &current.fields, &next.fields);
        if !details.is_empty() {
            return AgentOutcome::structural_mismatch(details);
        }
        current.checksum = next.checksum;

        state.live_edits.push(LiveEditRecord {
            class_name: name.clone(),
            is_composable_body: request.is_composable_body,
            source_start_offset: request.source_start_offset,
            source_end_offset: request.source_end_offset,
        });
        debug!(class = %name, "Live edit applied");
        AgentOutcome::ok()
    }

    fn update_literals(&self, request: &LiveLiteralUpdateRequest) -> AgentOutcome {
        let mut state = self.lock();

        for update in &request.updates {
            if !state.classes.contains_key(&update.helper_class_name) {
                return AgentOutcome::failure(
                    AgentStatus::ClassNotFound,
                    update.helper_class_name.clone(),
                );
            }
            let accepted = FieldType::parse(&update.declared_type)
                .is_ok_and(|ty| ty.accepts_literal(&update.literal_value));
            if !accepted {
                return AgentOutcome::failure(
                    AgentStatus::RedefinitionFailed,
                    format!(
                        "{:?} is not a {} literal",
                        update.literal_value, update.declared_type
                    ),
                );
            }
        }

        for update in &request.updates {
            state.literals.insert(
                (update.helper_class_name.clone(), update.source_offset),
                update.literal_value.clone(),
            );
        }
        debug!(updates = request.updates.len(), "Literals updated");
        AgentOutcome::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::classfile::{ACC_FINAL, ACC_STATIC};
    use crate::bytecode::fixture::ClassBuilder;
    use crate::bytecode::ConstantValue;
    use crate::reinit::{FieldReinitEntry, UnsupportedReinit};
    use crate::request::ModifiedClass;

    const STATIC_FINAL: u16 = ACC_STATIC | ACC_FINAL;

    fn unit(name: &str, code: Vec<u8>) -> ClassBytecodeUnit {
        ClassBytecodeUnit {
            name: name.into(),
            checksum: Checksum::of(&code),
            code: Some(code),
        }
    }

    fn modified(name: &str, code: Vec<u8>) -> ModifiedClass {
        ModifiedClass {
            unit: unit(name, code),
            reinit: Vec::new(),
        }
    }

    fn swap(modified_classes: Vec<ModifiedClass>) -> ClassSwapRequest {
        ClassSwapRequest {
            package_name: "com.app".into(),
            restart_activity_on_apply: false,
            allow_structural_redefinition: false,
            allow_variable_reinit: false,
            modified_classes,
            new_classes: Vec::new(),
        }
    }

    fn class_a() -> ClassBuilder {
        ClassBuilder::new("a/A")
            .field(STATIC_FINAL, "FIELD_A", "I")
            .field(STATIC_FINAL, "FIELD_B", "I")
    }

    fn runtime_with_a_and_b() -> InMemoryRuntime {
        let runtime = InMemoryRuntime::new();
        runtime.load("a.A", &class_a().build()).unwrap();
        runtime
            .load("a.B", &ClassBuilder::new("a/B").field(0, "count", "J").build())
            .unwrap();
        runtime
    }

    #[test]
    fn swap_replaces_code() {
        let runtime = runtime_with_a_and_b();
        // Same fields, different bytes.
        let mut code = class_a().build();
        code.push(0);
        let request = swap(vec![modified("a.A", code.clone())]);

        let outcome = runtime.swap(&request);
        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(runtime.checksum("a.A"), Some(Checksum::of(&code)));
    }

    #[test]
    fn failing_class_leaves_batch_unchanged() {
        let runtime = runtime_with_a_and_b();
        let before_a = runtime.checksum("a.A");
        let before_b = runtime.checksum("a.B");

        let mut new_b = ClassBuilder::new("a/B").field(0, "count", "J").build();
        new_b.push(0);
        let request = ClassSwapRequest {
            new_classes: vec![unit("a.New", ClassBuilder::new("a/New").build())],
            ..swap(vec![
                modified("a.B", new_b),
                modified("a.Missing", ClassBuilder::new("a/Missing").build()),
            ])
        };

        let outcome = runtime.swap(&request);
        assert_eq!(outcome.status, AgentStatus::ClassNotFound);
        assert_eq!(outcome.message.as_deref(), Some("a.Missing"));
        assert_eq!(runtime.checksum("a.A"), before_a);
        assert_eq!(runtime.checksum("a.B"), before_b);
        assert!(!runtime.is_loaded("a.New"));
    }

    #[test]
    fn field_changes_are_reported_exactly() {
        let runtime = runtime_with_a_and_b();
        let new_a = ClassBuilder::new("a/A")
            .field(STATIC_FINAL, "FIELD_A", "I")
            .field(STATIC_FINAL, "FIELD_C", "I")
            .build();
        let new_b = ClassBuilder::new("a/B").field(0, "count", "I").build();

        let outcome = runtime.swap(&swap(vec![modified("a.A", new_a), modified("a.B", new_b)]));
        assert_eq!(outcome.status, AgentStatus::StructuralMismatch);
        assert_eq!(
            outcome.details,
            vec![
                OutcomeDetail::field("a.A", "FIELD_B", DetailKind::FieldRemoved),
                OutcomeDetail::field("a.A", "FIELD_C", DetailKind::FieldAdded),
                OutcomeDetail::field("a.B", "count", DetailKind::FieldRemoved),
                OutcomeDetail::field("a.B", "count", DetailKind::FieldAdded),
            ]
        );
        assert_eq!(outcome.fields_added("a.A"), vec!["FIELD_C"]);
        assert_eq!(outcome.fields_removed("a.A"), vec!["FIELD_B"]);
        assert_eq!(
            runtime.field_names("a.A").unwrap(),
            vec!["FIELD_A", "FIELD_B"]
        );
    }

    #[test]
    fn structural_permission_applies_shape_changes() {
        let runtime = runtime_with_a_and_b();
        let new_a = class_a().field(0, "extra", "Z").build();
        let request = ClassSwapRequest {
            allow_structural_redefinition: true,
            ..swap(vec![modified("a.A", new_a)])
        };

        assert!(runtime.swap(&request).is_ok());
        assert_eq!(
            runtime.field_names("a.A").unwrap(),
            vec!["FIELD_A", "FIELD_B", "extra"]
        );
    }

    #[test]
    fn reinit_carries_constants_and_rejects_the_rest() {
        let runtime = runtime_with_a_and_b();
        let safe = FieldInfo {
            name: "LIMIT".into(),
            descriptor: "I".into(),
            access_flags: STATIC_FINAL,
            constant_value: Some(ConstantValue::Int(7)),
        };
        let new_a = class_a()
            .constant(STATIC_FINAL, "LIMIT", "I", ConstantValue::Int(7))
            .build();

        let request = ClassSwapRequest {
            allow_structural_redefinition: true,
            allow_variable_reinit: true,
            ..swap(vec![ModifiedClass {
                unit: unit("a.A", new_a.clone()),
                reinit: vec![FieldReinitEntry::from_field(&safe)],
            }])
        };
        assert!(runtime.swap(&request).is_ok());
        assert_eq!(runtime.static_value("a.A", "LIMIT").as_deref(), Some("7"));

        let table = FieldInfo {
            name: "TABLE".into(),
            descriptor: "[I".into(),
            access_flags: STATIC_FINAL,
            constant_value: None,
        };
        let newer_a = ClassBuilder::new("a/A")
            .field(STATIC_FINAL, "FIELD_A", "I")
            .field(STATIC_FINAL, "FIELD_B", "I")
            .constant(STATIC_FINAL, "LIMIT", "I", ConstantValue::Int(7))
            .field(STATIC_FINAL, "TABLE", "[I")
            .build();
        let request = ClassSwapRequest {
            allow_structural_redefinition: true,
            allow_variable_reinit: true,
            ..swap(vec![ModifiedClass {
                unit: unit("a.A", newer_a),
                reinit: vec![FieldReinitEntry::from_field(&table)],
            }])
        };
        let outcome = runtime.swap(&request);
        assert_eq!(
            outcome.unsupported_reinit(),
            Some(UnsupportedReinit::StaticArray)
        );
        assert_eq!(outcome.message.as_deref(), Some("a.A.TABLE"));
        assert_eq!(runtime.checksum("a.A"), Some(Checksum::of(&new_a)));
    }

    #[test]
    fn live_edit_rejects_shape_changes() {
        let runtime = runtime_with_a_and_b();
        let mut same_shape = class_a().build();
        same_shape.push(0);
        let request = LiveEditRequest {
            package_name: "com.app".into(),
            target_class_name: "a.A".into(),
            is_composable_body: true,
            source_start_offset: 10,
            source_end_offset: 20,
            class_data: same_shape,
        };
        assert!(runtime.live_edit(&request).is_ok());
        assert_eq!(runtime.live_edits().len(), 1);
        assert!(runtime.live_edits()[0].is_composable_body);

        let reshaped = LiveEditRequest {
            class_data: ClassBuilder::new("a/A").build(),
            ..request.clone()
        };
        let outcome = runtime.live_edit(&reshaped);
        assert_eq!(outcome.status, AgentStatus::StructuralMismatch);
        assert_eq!(outcome.fields_removed("a.A"), vec!["FIELD_A", "FIELD_B"]);
        assert_eq!(runtime.live_edits().len(), 1);

        let missing = LiveEditRequest {
            target_class_name: "a.Missing".into(),
            ..request
        };
        assert_eq!(runtime.live_edit(&missing).status, AgentStatus::ClassNotFound);
    }

    #[test]
    fn literal_updates_are_all_or_nothing() {
        use crate::request::LiteralUpdate;

        let runtime = runtime_with_a_and_b();
        let update = |offset, ty: &str, value: &str| LiteralUpdate {
            helper_class_name: "a.A".into(),
            source_offset: offset,
            declared_type: ty.into(),
            literal_value: value.into(),
        };
        let request = LiveLiteralUpdateRequest {
            package_name: "com.app".into(),
            updates: vec![update(1, "I", "5"), update(2, "Z", "maybe")],
        };

        let outcome = runtime.update_literals(&request);
        assert_eq!(outcome.status, AgentStatus::RedefinitionFailed);
        assert!(runtime.literal("a.A", 1).is_none());

        let request = LiveLiteralUpdateRequest {
            updates: vec![update(1, "I", "5"), update(2, "Z", "true")],
            ..request
        };
        assert!(runtime.update_literals(&request).is_ok());
        assert_eq!(runtime.literal("a.A", 1).as_deref(), Some("5"));
        assert_eq!(runtime.literal("a.A", 2).as_deref(), Some("true"));
    }
}
