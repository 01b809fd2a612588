use super::{CrdtAlgorithm, MergeInput, MergeOutcome, Register, Transformation};
use crate::error::Result;
use crate::recipe::AlgorithmId;
use crate::value::Value;

/// Presence-aware register for optional fields, map entries and object
/// properties.
///
/// A delete beats a concurrent set. When the deleting write descends
/// from the setting write the two are not concurrent and plain
/// last-writer-wins applies; in a two-branch merge that case collapses
/// into the branch's own last change before the algorithm runs.
pub struct OptionalValue;

impl CrdtAlgorithm for OptionalValue {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::OptionalValue
    }

    fn diff(&self, old: Option<&Value>, new: Option<&Value>) -> Vec<Transformation> {
        match (old, new) {
            (Some(_), None) => vec![Transformation::delete()],
            (_, Some(new)) if old != Some(new) => vec![Transformation::set(new.clone())],
            _ => Vec::new(),
        }
    }

    fn merge(&self, input: &MergeInput) -> Result<MergeOutcome> {
        match (&input.left.change, &input.right.change) {
            (Some(l), Some(r)) => {
                if l.deleted || r.deleted {
                    Ok(MergeOutcome::Value(None))
                } else {
                    Register.merge(input)
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

    #[test]
    fn concurrent_delete_beats_set() {
        let anc = Value::Integer(1);
        let ab = input(
            Some(anc.clone()),
            branch(None, Some(deletion(1, 1))),
            branch(Some(Value::Integer(2)), Some(change(9, 9))),
        );
        assert_eq!(OptionalValue.merge(&ab).unwrap(), MergeOutcome::Value(None));
        let ba = input(
            Some(anc),
            branch(Some(Value::Integer(2)), Some(change(9, 9))),
            branch(None, Some(deletion(1, 1))),
        );
        assert_eq!(OptionalValue.merge(&ba).unwrap(), MergeOutcome::Value(None));
    }

    #[test]
    fn concurrent_sets_fall_back_to_register() {
        let input = input(
            Some(Value::Integer(1)),
            branch(Some(Value::Integer(2)), Some(change(10, 1))),
            branch(Some(Value::Integer(3)), Some(change(20, 2))),
        );
        assert_eq!(
            OptionalValue.merge(&input).unwrap(),
            MergeOutcome::Value(Some(Value::Integer(3)))
        );
    }

    #[test]
    fn single_sided_delete_applies() {
        let input = input(
            Some(Value::Integer(1)),
            branch(None, Some(deletion(1, 1))),
            branch(Some(Value::Integer(1)), None),
        );
        assert_eq!(
            OptionalValue.merge(&input).unwrap(),
            MergeOutcome::Value(None)
        );
    }

    #[test]
    fn diff_distinguishes_set_and_delete() {
        let v = Value::Integer(1);
        assert_eq!(
            OptionalValue.diff(Some(&v), None),
            vec![Transformation::delete()]
        );
        assert_eq!(
            OptionalValue.diff(None, Some(&v)),
            vec![Transformation::set(v.clone())]
        );
        assert!(OptionalValue.diff(Some(&v), Some(&v)).is_empty());
    }
}
