use std::fmt;
use std::sync::Weak;

use self::error::LinkViewInvalid;
use crate::control::ControlState;
use crate::link::DeviceLink;
use crate::unit::UnitId;

pub mod error;

/// A weak handle to a link owned by a [`Fleet`](super::Fleet), giving scoped access through
/// [`view`](Self::view).
#[derive(Clone)]
pub struct LinkRef {
    unit_id: UnitId,
    link: Weak<DeviceLink>,
}

impl LinkRef {
    pub(super) fn new(unit_id: UnitId, link: Weak<DeviceLink>) -> Self {
        Self { unit_id, link }
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }

    /// Run `view_fn` against the link if the fleet still holds it.
    pub fn view<F: FnOnce(&DeviceLink) -> R, R>(&self, view_fn: F) -> Result<R, LinkViewInvalid> {
        Weak::upgrade(&self.link)
            .map(|link| view_fn(&link))
            .ok_or_else(|| LinkViewInvalid {
                unit_id: self.unit_id.clone(),
            })
    }

    /// Current control state of the link.
    pub fn control_state(&self) -> Result<ControlState, LinkViewInvalid> {
        self.view(|link| link.control().state())
    }

    pub fn is_valid(&self) -> bool {
        self.link.strong_count() > 0
    }
}

impl fmt::Debug for LinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRef")
            .field("unit_id", &self.unit_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A [`LinkRef`] is identified by its [`UnitId`] alone.
impl PartialEq<UnitId> for LinkRef {
    fn eq(&self, other: &UnitId) -> bool {
        self.unit_id == *other
    }
}

impl PartialEq<LinkRef> for UnitId {
    fn eq(&self, other: &LinkRef) -> bool {
        *self == other.unit_id
    }
}
