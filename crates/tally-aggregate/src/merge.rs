use std::any::Any;

use tally_core::{Result, StatsError};

/// Shared surface of the stateful aggregators.
///
/// `merge_from` folds another aggregator of the same kind into this one.
/// Counters, sets and bounds merge exactly; the receiver keeps its own
/// Welford and t-digest state where the two overlap.
pub trait Aggregate: Any + Send + Sync {
    fn kind(&self) -> &'static str;

    fn reset(&self);

    fn merge_from(&self, other: &dyn Aggregate) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Resolves `other` to the receiver's concrete type, refusing self-merges.
pub(crate) fn downcast<'a, T: Aggregate>(receiver: &T, other: &'a dyn Aggregate) -> Result<&'a T> {
    let Some(other_typed) = other.as_any().downcast_ref::<T>() else {
        return Err(StatsError::merge_incompatible(format!(
            "{} into {}",
            other.kind(),
            receiver.kind()
        )));
    };
    if std::ptr::eq(receiver, other_typed) {
        return Err(StatsError::merge_incompatible(format!(
            "{} into itself",
            receiver.kind()
        )));
    }
    Ok(other_typed)
}
