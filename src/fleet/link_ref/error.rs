use crate::unit::UnitId;

/// Indicates that the fleet removed the link a [`LinkRef`](super::LinkRef) pointed to.
#[derive(Debug, thiserror::Error)]
#[error("the link for unit {unit_id} is no longer registered")]
pub struct LinkViewInvalid {
    pub unit_id: UnitId,
}
