use crate::unit::UnitId;

/// Indicates that a link could not be added because one for the same unit is already registered.
#[derive(Debug, thiserror::Error)]
#[error("a link for unit {unit_id} is already registered")]
pub struct LinkAlreadyPresent {
    pub unit_id: UnitId,
}

/// Indicates that no link is registered for the unit.
#[derive(Debug, thiserror::Error)]
#[error("no link registered for unit {unit_id}")]
pub struct LinkNotFound {
    pub unit_id: UnitId,
}
