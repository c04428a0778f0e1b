//! Storage port — repository traits for persistence.

use std::future::Future;
use std::sync::Arc;

use homebus_domain::bus::Bus;
use homebus_domain::element::Element;
use homebus_domain::error::HomeBusError;
use homebus_domain::id::OwnerId;

/// Repository for an owner's inventory [`Element`] tree.
pub trait ElementRepository: Send + Sync {
    /// Every element of `owner`, in no particular order.
    fn get_elements(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Element>, HomeBusError>> + Send;

    /// Upsert `elements` keyed by `element_id` as one batch.
    ///
    /// Either every element is written or none is.
    fn save_elements(
        &self,
        owner: OwnerId,
        elements: Vec<Element>,
    ) -> impl Future<Output = Result<(), HomeBusError>> + Send;
}

impl<T: ElementRepository> ElementRepository for Arc<T> {
    fn get_elements(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Element>, HomeBusError>> + Send {
        (**self).get_elements(owner)
    }

    fn save_elements(
        &self,
        owner: OwnerId,
        elements: Vec<Element>,
    ) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        (**self).save_elements(owner, elements)
    }
}

/// Repository for configured [`Bus`]es.
pub trait BusRepository: Send + Sync {
    /// Every configured bus across all owners.
    fn get_all(&self) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send;

    /// Buses belonging to `owner`.
    fn get_by_owner(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send;

    /// Upsert `buses` keyed by id as one batch.
    fn save_buses(&self, buses: Vec<Bus>) -> impl Future<Output = Result<(), HomeBusError>> + Send;
}

impl<T: BusRepository> BusRepository for Arc<T> {
    fn get_all(&self) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send {
        (**self).get_all()
    }

    fn get_by_owner(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send {
        (**self).get_by_owner(owner)
    }

    fn save_buses(&self, buses: Vec<Bus>) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        (**self).save_buses(buses)
    }
}
