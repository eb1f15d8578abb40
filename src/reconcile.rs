//! Set reconciliation for multi-valued attributes.
//!
//! The service exposes set membership (such as the permissions of a user on a
//! project) only through per-item add and remove calls. [`reconcile`] computes
//! the [`SetDelta`] between the declared and observed sets and applies it one
//! call per item, stopping at the first failure.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::types::RemoteObjectRef;

/// The difference between a desired and an observed set.
///
/// Both halves are kept in lexicographic order, which is also the order in
/// which changes are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDelta {
    /// Items present in the desired set only.
    pub to_add: BTreeSet<String>,
    /// Items present in the observed set only.
    pub to_remove: BTreeSet<String>,
}

impl SetDelta {
    /// Compute the delta between two sets. Duplicates are ignored.
    pub fn compute<D, O>(desired: D, observed: O) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        let desired: BTreeSet<String> = desired.into_iter().map(Into::into).collect();
        let observed: BTreeSet<String> = observed.into_iter().map(Into::into).collect();
        Self {
            to_add: desired.difference(&observed).cloned().collect(),
            to_remove: observed.difference(&desired).cloned().collect(),
        }
    }

    /// Whether the sets already agree.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Total number of calls needed.
    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }

    /// The changes in application order.
    pub fn changes(&self, order: ApplyOrder) -> Vec<SetChange> {
        let adds = self.to_add.iter().cloned().map(SetChange::Add);
        let removes = self.to_remove.iter().cloned().map(SetChange::Remove);
        match order {
            ApplyOrder::RemoveFirst => removes.chain(adds).collect(),
            ApplyOrder::AddFirst => adds.chain(removes).collect(),
        }
    }
}

/// Which half of a delta is applied first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyOrder {
    /// Removals, then additions.
    #[default]
    RemoveFirst,
    /// Additions, then removals.
    AddFirst,
}

/// One per-item call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetChange {
    /// Add the item.
    Add(String),
    /// Remove the item.
    Remove(String),
}

impl SetChange {
    /// The item concerned.
    pub fn item(&self) -> &str {
        match self {
            Self::Add(item) | Self::Remove(item) => item,
        }
    }
}

impl fmt::Display for SetChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(item) => write!(f, "add '{}'", item),
            Self::Remove(item) => write!(f, "remove '{}'", item),
        }
    }
}

/// A set delta that stopped part way.
///
/// Changes in `applied` took effect remotely and are not rolled back.
#[derive(Debug, Error)]
#[error("set reconciliation failed to {failed_at} after {} applied change(s): {source}", .applied.len())]
pub struct PartialFailure {
    /// Changes applied before the failure, in order.
    pub applied: Vec<SetChange>,
    /// The change whose call failed.
    pub failed_at: SetChange,
    /// The failure.
    pub source: Box<ProviderError>,
}

/// Per-item add and remove calls for one set-valued attribute.
#[async_trait]
pub trait SetOperations: Send + Sync {
    /// Add one item to the set of the object.
    async fn add(&self, reference: &RemoteObjectRef, item: &str) -> Result<(), ProviderError>;

    /// Remove one item from the set of the object.
    async fn remove(&self, reference: &RemoteObjectRef, item: &str) -> Result<(), ProviderError>;
}

/// Bring the remote set of `reference` from `observed` to `desired`.
///
/// Calls are issued one at a time in the order given by `order`, items in
/// lexicographic order within each half. Returns the number of calls made.
pub async fn reconcile<D, O>(
    reference: &RemoteObjectRef,
    desired: D,
    observed: O,
    order: ApplyOrder,
    ops: &dyn SetOperations,
) -> Result<usize, PartialFailure>
where
    D: IntoIterator,
    D::Item: Into<String>,
    O: IntoIterator,
    O::Item: Into<String>,
{
    let delta = SetDelta::compute(desired, observed);
    if delta.is_empty() {
        debug!(reference = %reference, "Set already in desired state");
        return Ok(0);
    }
    debug!(
        reference = %reference,
        to_add = delta.to_add.len(),
        to_remove = delta.to_remove.len(),
        "Reconciling set"
    );

    let mut applied = Vec::with_capacity(delta.len());
    for change in delta.changes(order) {
        let result = match &change {
            SetChange::Add(item) => ops.add(reference, item).await,
            SetChange::Remove(item) => ops.remove(reference, item).await,
        };
        if let Err(e) = result {
            warn!(
                reference = %reference,
                change = %change,
                applied = applied.len(),
                error = %e,
                "Set reconciliation stopped"
            );
            return Err(PartialFailure {
                applied,
                failed_at: change,
                source: Box::new(e),
            });
        }
        applied.push(change);
    }

    Ok(applied.len())
}
