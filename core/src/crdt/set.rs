use super::{CrdtAlgorithm, MergeInput, MergeOutcome, Op, Transformation};
use crate::error::Result;
use crate::recipe::AlgorithmId;
use crate::value::Value;

/// Commutative add/remove union over container elements.
///
/// A remove only affects elements the removing branch observed, so a
/// remove of an absent element is a no-op and concurrent adds survive.
pub struct Set;

fn elements(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(items)) | Some(Value::Bag(items)) | Some(Value::Set(items)) => items,
        _ => &[],
    }
}

/// Rebuilds a container of the same flavor as the exemplar.
fn container_like(exemplar: Option<&Value>, items: Vec<Value>) -> Value {
    match exemplar {
        Some(Value::Array(_)) => Value::Array(items),
        Some(Value::Bag(_)) => Value::Bag(items),
        _ => Value::Set(items),
    }
}

impl CrdtAlgorithm for Set {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::Set
    }

    fn diff(&self, old: Option<&Value>, new: Option<&Value>) -> Vec<Transformation> {
        let old_items = elements(old);
        let new_items = elements(new);
        let mut out = Vec::new();
        for item in new_items {
            if !old_items.contains(item) {
                out.push(Transformation::add(item.clone()));
            }
        }
        for item in old_items {
            if !new_items.contains(item) {
                out.push(Transformation::remove(item.clone()));
            }
        }
        out
    }

    fn merge(&self, input: &MergeInput) -> Result<MergeOutcome> {
        let ancestor = elements(input.ancestor.as_ref());
        let left_ops = self.diff(input.ancestor.as_ref(), input.left.value.as_ref());
        let right_ops = self.diff(input.ancestor.as_ref(), input.right.value.as_ref());

        let removed: Vec<&Value> = left_ops
            .iter()
            .chain(&right_ops)
            .filter(|t| t.op == Op::Remove)
            .filter_map(|t| t.value.as_ref())
            .collect();
        let mut merged: Vec<Value> = ancestor
            .iter()
            .filter(|item| !removed.contains(item))
            .cloned()
            .collect();
        for add in left_ops
            .iter()
            .chain(&right_ops)
            .filter(|t| t.op == Op::Add)
        {
            if let Some(item) = &add.value {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
        }
        let exemplar = input
            .left
            .value
            .as_ref()
            .or(input.right.value.as_ref())
            .or(input.ancestor.as_ref());
        Ok(MergeOutcome::Value(Some(container_like(exemplar, merged))))
    }
}
