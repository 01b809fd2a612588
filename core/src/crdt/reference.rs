use super::{CrdtAlgorithm, MergeInput, MergeOutcome, Register, Transformation};
use crate::error::{Error, Result};
use crate::recipe::AlgorithmId;
use crate::value::Value;

/// Merge through an object reference.
///
/// When both branches rewrote the reference and the referenced type is
/// unchanged, the traversal descends into the referenced objects and
/// merges them field by field. A type change degrades the reference to
/// a register over the two hashes. A reference whose type is unknown on
/// both sides cannot be merged.
pub struct ReferenceToObject;

impl CrdtAlgorithm for ReferenceToObject {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::ReferenceToObject
    }

    fn diff(&self, old: Option<&Value>, new: Option<&Value>) -> Vec<Transformation> {
        Register.diff(old, new)
    }

    fn merge(&self, input: &MergeInput) -> Result<MergeOutcome> {
        let (left, right) = match (&input.left.change, &input.right.change) {
            (Some(_), Some(_)) => (&input.left, &input.right),
            // one or no branch touched the reference: no conflict
            _ => return Register.merge(input),
        };
        let types = input.ref_types.as_ref().ok_or_else(|| {
            Error::MergeConflict(format!("{}: reference types unresolved", input.path))
        })?;
        match (&types.left, &types.right) {
            (None, None) => Err(Error::MergeConflict(format!(
                "{}: referenced type unknown on both sides",
                input.path
            ))),
            (Some(l), Some(r)) if l == r && types.ancestor.as_ref().map_or(true, |a| a == l) => {
                // same type throughout: merge the referenced objects
                if left.value == right.value {
                    Ok(MergeOutcome::Value(left.value.clone()))
                } else {
                    Ok(MergeOutcome::Iterate)
                }
            }
            _ => Register.merge(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::crdt::RefTypes;
    use crate::hash::Hash;

    fn obj_ref(byte: u8) -> Value {
        Value::ObjRef(Hash::new([byte; 32]))
    }

    fn with_types(mut input: MergeInput, types: RefTypes) -> MergeInput {
        input.ref_types = Some(types);
        input
    }

    #[test]
    fn single_sided_change_takes_the_reference() {
        let input = input(
            Some(obj_ref(1)),
            branch(Some(obj_ref(2)), Some(change(1, 1))),
            branch(Some(obj_ref(1)), None),
        );
        assert_eq!(
            ReferenceToObject.merge(&input).unwrap(),
            MergeOutcome::Value(Some(obj_ref(2)))
        );
    }

    #[test]
    fn same_type_iterates() {
        let input = with_types(
            input(
                Some(obj_ref(1)),
                branch(Some(obj_ref(2)), Some(change(1, 1))),
                branch(Some(obj_ref(3)), Some(change(2, 2))),
            ),
            RefTypes {
                ancestor: Some("Note".to_owned()),
                left: Some("Note".to_owned()),
                right: Some("Note".to_owned()),
            },
        );
        assert_eq!(
            ReferenceToObject.merge(&input).unwrap(),
            MergeOutcome::Iterate
        );
    }

    #[test]
    fn changed_type_degrades_to_register() {
        let input = with_types(
            input(
                Some(obj_ref(1)),
                branch(Some(obj_ref(2)), Some(change(1, 0x11))),
                branch(Some(obj_ref(3)), Some(change(1, 0x22))),
            ),
            RefTypes {
                ancestor: Some("Note".to_owned()),
                left: Some("Note".to_owned()),
                right: Some("Memo".to_owned()),
            },
        );
        assert_eq!(
            ReferenceToObject.merge(&input).unwrap(),
            MergeOutcome::Value(Some(obj_ref(3)))
        );
    }

    #[test]
    fn unknown_type_on_both_sides_is_a_conflict() {
        let input = with_types(
            input(
                None,
                branch(Some(obj_ref(2)), Some(change(1, 1))),
                branch(Some(obj_ref(3)), Some(change(2, 2))),
            ),
            RefTypes::default(),
        );
        assert!(matches!(
            ReferenceToObject.merge(&input),
            Err(Error::MergeConflict(_))
        ));
    }
}
