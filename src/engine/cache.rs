use std::collections::HashMap;

use crate::catalog::Catalog;
use crate::model::{Business, Cents, Profile, Service};

use super::EngineError;

/// Memoizes catalog reads for the lifetime of one query. Misses are cached
/// too, so a dangling reference costs a single lookup.
pub(super) struct CatalogCache<'a> {
    catalog: &'a dyn Catalog,
    services: HashMap<String, Option<Service>>,
    businesses: HashMap<String, Option<Business>>,
    profiles: HashMap<String, Option<Profile>>,
}

impl<'a> CatalogCache<'a> {
    pub(super) fn new(catalog: &'a dyn Catalog) -> Self {
        Self {
            catalog,
            services: HashMap::new(),
            businesses: HashMap::new(),
            profiles: HashMap::new(),
        }
    }

    pub(super) async fn service(&mut self, id: &str) -> Result<Option<Service>, EngineError> {
        if let Some(hit) = self.services.get(id) {
            return Ok(hit.clone());
        }
        let found = self.catalog.get_service(id).await?;
        self.services.insert(id.to_string(), found.clone());
        Ok(found)
    }

    pub(super) async fn business(&mut self, id: &str) -> Result<Option<Business>, EngineError> {
        if let Some(hit) = self.businesses.get(id) {
            return Ok(hit.clone());
        }
        let found = self.catalog.get_business(id).await?;
        self.businesses.insert(id.to_string(), found.clone());
        Ok(found)
    }

    pub(super) async fn profile(&mut self, id: &str) -> Result<Option<Profile>, EngineError> {
        if let Some(hit) = self.profiles.get(id) {
            return Ok(hit.clone());
        }
        let found = self.catalog.get_profile(id).await?;
        self.profiles.insert(id.to_string(), found.clone());
        Ok(found)
    }

    /// Price of a service, 0 when it no longer exists.
    pub(super) async fn price(&mut self, service_id: &str) -> Result<Cents, EngineError> {
        Ok(self.service(service_id).await?.map_or(0, |s| s.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::catalog::{BusinessLookup, CatalogError, ProfileLookup, ServiceLookup};

    #[derive(Default)]
    struct CountingCatalog {
        service_reads: AtomicUsize,
    }

    #[async_trait]
    impl ServiceLookup for CountingCatalog {
        async fn get_service(&self, id: &str) -> Result<Option<Service>, CatalogError> {
            self.service_reads.fetch_add(1, Ordering::SeqCst);
            if id != "s1" {
                return Ok(None);
            }
            Ok(Some(Service {
                id: "s1".into(),
                business_id: "b1".into(),
                name: "Trim".into(),
                description: String::new(),
                price: 2500,
                duration_minutes: 30,
                is_active: true,
                tags: vec![],
                category: None,
            }))
        }
    }

    #[async_trait]
    impl BusinessLookup for CountingCatalog {
        async fn get_business(&self, _id: &str) -> Result<Option<Business>, CatalogError> {
            Err(CatalogError::Unavailable("down".into()))
        }
        async fn businesses_by_provider(&self, _: &str) -> Result<Vec<Business>, CatalogError> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl ProfileLookup for CountingCatalog {
        async fn get_profile(&self, _id: &str) -> Result<Option<Profile>, CatalogError> {
            Ok(None)
        }
        async fn get_profile_by_email(&self, _: &str) -> Result<Option<Profile>, CatalogError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn hits_and_misses_are_memoized() {
        let catalog = CountingCatalog::default();
        let mut cache = CatalogCache::new(&catalog);
        assert_eq!(cache.price("s1").await.unwrap(), 2500);
        assert_eq!(cache.price("s1").await.unwrap(), 2500);
        assert_eq!(cache.price("gone").await.unwrap(), 0);
        assert!(cache.service("gone").await.unwrap().is_none());
        assert_eq!(catalog.service_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn catalog_failure_surfaces_as_internal() {
        let catalog = CountingCatalog::default();
        let mut cache = CatalogCache::new(&catalog);
        assert!(matches!(
            cache.business("b1").await,
            Err(EngineError::Internal(_))
        ));
    }
}
