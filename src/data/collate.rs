//! Collation rules for optional per-item fields

use candle_core::{Result, Tensor};

/// Stack optional per-item tensors along a new leading axis.
///
/// Returns `None` when no item has the field. Otherwise items without it
/// contribute zeros shaped like the first present tensor.
pub fn stack_with_zero_fill(items: &[Option<&Tensor>]) -> Result<Option<Tensor>> {
    let Some(base) = items.iter().flatten().next() else {
        return Ok(None);
    };

    let rows = items
        .iter()
        .map(|item| match item {
            Some(tensor) => Ok((*tensor).clone()),
            None => base.zeros_like(),
        })
        .collect::<Result<Vec<_>>>()?;

    Tensor::stack(&rows, 0).map(Some)
}

/// Outcome of gathering a field that must be present on all items or none
#[derive(Debug, PartialEq)]
pub enum AllOrNone<T> {
    None,
    All(Vec<T>),
    /// Index of the first item missing the field
    Partial(usize),
}

pub fn collect_all_or_none<T: Clone>(items: &[Option<&T>]) -> AllOrNone<T> {
    if items.iter().all(|item| item.is_none()) {
        return AllOrNone::None;
    }
    if let Some(missing) = items.iter().position(|item| item.is_none()) {
        return AllOrNone::Partial(missing);
    }
    AllOrNone::All(items.iter().flatten().map(|item| (*item).clone()).collect())
}
