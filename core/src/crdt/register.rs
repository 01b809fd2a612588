use super::{CrdtAlgorithm, MergeInput, MergeOutcome, Transformation};
use crate::error::Result;
use crate::recipe::AlgorithmId;
use crate::value::Value;

/// Last-writer-wins register over a primitive value.
///
/// On concurrent writes the winner is the branch whose writing version
/// has the greater creation time; equal times fall back to version hash
/// order. A branch that wrote nothing since the ancestor never beats a
/// branch that did.
pub struct Register;

impl CrdtAlgorithm for Register {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::Register
    }

    fn diff(&self, old: Option<&Value>, new: Option<&Value>) -> Vec<Transformation> {
        match new {
            Some(new) if old != Some(new) => vec![Transformation::set(new.clone())],
            None if old.is_some() => vec![Transformation::delete()],
            _ => Vec::new(),
        }
    }

    fn merge(&self, input: &MergeInput) -> Result<MergeOutcome> {
        let value = match (&input.left.change, &input.right.change) {
            (None, None) => input.left.value.clone(),
            (Some(_), None) => input.left.value.clone(),
            (None, Some(_)) => input.right.value.clone(),
            (Some(l), Some(r)) => {
                if l.beats(r) {
                    input.left.value.clone()
                } else {
                    input.right.value.clone()
                }
            }
        };
        Ok(MergeOutcome::Value(value))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    #[test]
    fn diff_emits_set_on_change_only() {
        let old = Value::Integer(1);
        let new = Value::Integer(2);
        assert_eq!(
            Register.diff(Some(&old), Some(&new)),
            vec![Transformation::set(new.clone())]
        );
        assert!(Register.diff(Some(&new), Some(&new)).is_empty());
        assert_eq!(
            Register.initial_diff(&new),
            vec![Transformation::set(new)]
        );
    }

    #[test]
    fn unchanged_branch_never_wins() {
        let input = input(
            Some(Value::Integer(1)),
            branch(Some(Value::Integer(1)), None),
            branch(Some(Value::Integer(2)), Some(change(5, 1))),
        );
        assert_eq!(
            Register.merge(&input).unwrap(),
            MergeOutcome::Value(Some(Value::Integer(2)))
        );
    }

    #[test]
    fn later_time_wins() {
        let input = input(
            None,
            branch(Some(Value::Integer(1)), Some(change(1000, 0x11))),
            branch(Some(Value::Integer(2)), Some(change(2000, 0x01))),
        );
        assert_eq!(
            Register.merge(&input).unwrap(),
            MergeOutcome::Value(Some(Value::Integer(2)))
        );
    }

    #[test]
    fn equal_time_greater_hash_wins() {
        let a = branch(Some(Value::Integer(1)), Some(change(1000, 0x11)));
        let b = branch(Some(Value::Integer(2)), Some(change(1000, 0x22)));
        let ab = input(None, a.clone(), b.clone());
        let ba = input(None, b, a);
        let expect = MergeOutcome::Value(Some(Value::Integer(2)));
        assert_eq!(Register.merge(&ab).unwrap(), expect);
        assert_eq!(Register.merge(&ba).unwrap(), expect);
    }
}
