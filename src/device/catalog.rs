//! Device recognition
//!
//! Specialized factories are tried in registration order and the first one
//! that recognizes an advertisement builds the device. The generic factory,
//! when present, only sees what every specialized factory declined.

use std::sync::Arc;

use super::generic::GenericFactory;
use super::smart_vase::SmartVaseFactory;
use super::{Device, DeviceContext};
use crate::ble::Advertisement;

/// Builds one device variant.
pub trait DeviceFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    fn recognizes(&self, adv: &Advertisement) -> bool;

    fn build(&self, adv: &Advertisement, ctx: &DeviceContext) -> Arc<dyn Device>;
}

#[derive(Default)]
pub struct DeviceCatalog {
    factories: Vec<Box<dyn DeviceFactory>>,
    fallback: Option<Box<dyn DeviceFactory>>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the Smart Vase and, when `generic_name_filters` is
    /// given, the generic fallback.
    pub fn standard(smart_vase: bool, generic_name_filters: Option<Vec<String>>) -> Self {
        let mut catalog = Self::new();
        if smart_vase {
            catalog = catalog.with_factory(SmartVaseFactory);
        }
        if let Some(filters) = generic_name_filters {
            catalog = catalog.with_fallback(GenericFactory::new(filters));
        }
        catalog
    }

    pub fn with_factory(mut self, factory: impl DeviceFactory + 'static) -> Self {
        self.factories.push(Box::new(factory));
        self
    }

    pub fn with_fallback(mut self, factory: impl DeviceFactory + 'static) -> Self {
        self.fallback = Some(Box::new(factory));
        self
    }

    /// Build a device for an advertisement, or `None` if nothing claims it.
    pub fn recognize(&self, adv: &Advertisement, ctx: &DeviceContext) -> Option<Arc<dyn Device>> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.recognizes(adv))
            .or_else(|| self.fallback.as_ref().filter(|f| f.recognizes(adv)))?;

        log::debug!("{} recognized as {}", adv.peripheral_id, factory.kind());
        Some(factory.build(adv, ctx))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories
            .iter()
            .chain(self.fallback.iter())
            .map(|f| f.kind())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackRegistry, ReadingSink};
    use crate::model::PeripheralId;

    fn ctx() -> DeviceContext {
        DeviceContext::new(ReadingSink::new(Arc::new(CallbackRegistry::new())))
    }

    #[test]
    fn test_specialized_factory_wins() {
        let catalog = DeviceCatalog::standard(true, Some(Vec::new()));
        assert_eq!(catalog.kinds(), vec!["smart_vase", "generic"]);

        let adv = Advertisement::new(PeripheralId::new("p1")).with_local_name("BBC micro:bit [zavog]");
        let device = catalog.recognize(&adv, &ctx()).unwrap();
        assert_eq!(device.kind(), "smart_vase");

        let adv = Advertisement::new(PeripheralId::new("p2")).with_name("Thermo");
        let device = catalog.recognize(&adv, &ctx()).unwrap();
        assert_eq!(device.kind(), "generic");
        assert_eq!(device.name(), "Thermo");
    }

    #[test]
    fn test_unrecognized_is_ignored() {
        let catalog = DeviceCatalog::standard(true, None);
        let adv = Advertisement::new(PeripheralId::new("p2")).with_name("Thermo");
        assert!(catalog.recognize(&adv, &ctx()).is_none());

        let catalog = DeviceCatalog::standard(false, Some(vec!["bbc micro:bit".into()]));
        assert!(catalog.recognize(&adv, &ctx()).is_none());
        let microbit = Advertisement::new(PeripheralId::new("p3")).with_local_name("BBC micro:bit");
        assert_eq!(catalog.recognize(&microbit, &ctx()).unwrap().kind(), "generic");
    }
}
