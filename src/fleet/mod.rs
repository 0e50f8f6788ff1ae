use std::sync::Arc;

use dashmap::{DashMap, Entry};
use futures::future::join_all;
use tracing::info;

use self::error::{LinkAlreadyPresent, LinkNotFound};
use self::link_ref::LinkRef;
use crate::control::{AuthorityRequest, DrcModeRequest};
use crate::error::SessionResult;
use crate::link::DeviceLink;
use crate::unit::UnitId;

pub mod error;
pub mod link_ref;

/// The outcome of a fleet-wide operation for each unit, ordered by unit id.
pub type FleetResults = Vec<(UnitId, SessionResult<()>)>;

/// The device links of several gateways, keyed by [`UnitId`].
///
/// Once a link is inserted the fleet owns it; callers only get weak [`LinkRef`]s so that
/// [`remove`](Self::remove) really ends the link's lifetime.
#[derive(Debug, Default)]
pub struct Fleet {
    links: DashMap<UnitId, Arc<DeviceLink>, ahash::RandomState>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `link`, keyed by its unit id.
    pub fn insert(&self, link: DeviceLink) -> Result<(), LinkAlreadyPresent> {
        match self.links.entry(link.unit_id().clone()) {
            Entry::Occupied(entry) => Err(LinkAlreadyPresent {
                unit_id: entry.key().clone(),
            }),

            Entry::Vacant(slot) => {
                info!(unit_id = %link.unit_id(), "link added to fleet");
                slot.insert(Arc::new(link));
                Ok(())
            }
        }
    }

    /// Drop the link for `unit_id`. Outstanding [`LinkRef`]s become invalid.
    pub fn remove(&self, unit_id: &UnitId) -> Result<(), LinkNotFound> {
        self.links.remove(unit_id).ok_or_else(|| LinkNotFound {
            unit_id: unit_id.clone(),
        })?;

        info!(unit_id = %unit_id, "link removed from fleet");
        Ok(())
    }

    /// Lend the link for `unit_id`.
    pub fn get(&self, unit_id: &UnitId) -> Result<LinkRef, LinkNotFound> {
        self.links
            .view(unit_id, |_, link| LinkRef::new(unit_id.clone(), Arc::downgrade(link)))
            .ok_or_else(|| LinkNotFound {
                unit_id: unit_id.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Registered unit ids, sorted.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.links.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Request control authority on every link concurrently.
    pub async fn request_authority_all(&self, request: &AuthorityRequest) -> FleetResults {
        self.for_each(|link| {
            let request = request.clone();
            async move { link.control().request_authority(request).await }
        })
        .await
    }

    /// Enter DRC mode on every link concurrently, with the request `request_for` builds per unit.
    pub async fn enter_mode_all<F>(&self, request_for: F) -> FleetResults
    where
        F: Fn(&UnitId) -> DrcModeRequest,
    {
        self.for_each(|link| {
            let request = request_for(link.unit_id());
            async move { link.control().enter_mode(request).await }
        })
        .await
    }

    /// Shut down every link's control session concurrently.
    pub async fn shutdown_all(&self) -> FleetResults {
        self.for_each(|link| async move { link.shutdown().await })
            .await
    }

    /// Run `op` on a snapshot of the registered links. Each link is kept alive until its own
    /// operation finishes, even if it is removed meanwhile.
    async fn for_each<F, Fut>(&self, op: F) -> FleetResults
    where
        F: Fn(Arc<DeviceLink>) -> Fut,
        Fut: Future<Output = SessionResult<()>>,
    {
        let mut links: Vec<(UnitId, Arc<DeviceLink>)> = self
            .links
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));

        join_all(links.into_iter().map(|(unit_id, link)| {
            let fut = op(link);
            async move { (unit_id, fut.await) }
        }))
        .await
    }
}
