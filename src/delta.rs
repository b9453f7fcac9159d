//! Delta engine: decides which classes need their bytecode retransmitted.

use std::collections::HashSet;

use crate::bytecode::{ClassBytecodeUnit, ClassStore, StoredClass};

/// Emit every class of `store` in insertion order, attaching bytecode only
/// to the classes `is_changed` selects.
///
/// The outcome depends on the predicate alone; class names carry no meaning
/// here.
pub fn diff<F>(store: &ClassStore, mut is_changed: F) -> Vec<ClassBytecodeUnit>
where
    F: FnMut(&StoredClass) -> bool,
{
    store
        .iter()
        .map(|class| ClassBytecodeUnit {
            name: class.name.clone(),
            checksum: class.checksum,
            code: is_changed(class).then(|| class.code.clone()),
        })
        .collect()
}

/// Diff against the previously deployed snapshot: a class is changed when it
/// is new or its checksum differs from the same-named class in `previous`.
pub fn diff_against(store: &ClassStore, previous: &ClassStore) -> Vec<ClassBytecodeUnit> {
    diff(store, |class| previous.checksum(&class.name) != Some(class.checksum))
}

/// Names present in `previous` but missing from `store`, in `previous` order.
pub fn removed_classes(store: &ClassStore, previous: &ClassStore) -> Vec<String> {
    let current: HashSet<&str> = store.names().collect();
    previous
        .names()
        .filter(|name| !current.contains(name))
        .map(str::to_owned)
        .collect()
}
