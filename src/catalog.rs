//! Read-only lookups into the marketplace catalog (services, businesses,
//! profiles). The booking engine never mutates these; their CRUD lives
//! elsewhere.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::model::{Business, Profile, Service};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("catalog seed: {0}")]
    Seed(String),
}

#[async_trait]
pub trait ServiceLookup: Send + Sync {
    async fn get_service(&self, id: &str) -> Result<Option<Service>, CatalogError>;
}

#[async_trait]
pub trait BusinessLookup: Send + Sync {
    async fn get_business(&self, id: &str) -> Result<Option<Business>, CatalogError>;
    async fn businesses_by_provider(&self, provider_id: &str)
        -> Result<Vec<Business>, CatalogError>;
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, CatalogError>;
    async fn get_profile_by_email(&self, email: &str) -> Result<Option<Profile>, CatalogError>;
}

/// Everything the engine reads from the catalog.
pub trait Catalog: ServiceLookup + BusinessLookup + ProfileLookup {}

impl<T: ServiceLookup + BusinessLookup + ProfileLookup> Catalog for T {}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub businesses: Vec<Business>,
    #[serde(default)]
    pub services: Vec<Service>,
}

pub struct InMemoryCatalog {
    services: DashMap<String, Service>,
    businesses: DashMap<String, Business>,
    profiles: DashMap<String, Profile>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            businesses: DashMap::new(),
            profiles: DashMap::new(),
        }
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let catalog = Self::new();
        for p in seed.profiles {
            catalog.insert_profile(p);
        }
        for b in seed.businesses {
            catalog.insert_business(b);
        }
        for s in seed.services {
            catalog.insert_service(s);
        }
        catalog
    }

    /// Load a JSON seed file of the form `{"profiles": [..], "businesses": [..], "services": [..]}`.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Seed(format!("{}: {e}", path.display())))?;
        let seed: CatalogSeed =
            serde_json::from_str(&raw).map_err(|e| CatalogError::Seed(e.to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_service(&self, service: Service) {
        self.services.insert(service.id.clone(), service);
    }

    pub fn insert_business(&self, business: Business) {
        self.businesses.insert(business.id.clone(), business);
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.profiles.len(), self.businesses.len(), self.services.len())
    }
}

#[async_trait]
impl ServiceLookup for InMemoryCatalog {
    async fn get_service(&self, id: &str) -> Result<Option<Service>, CatalogError> {
        Ok(self.services.get(id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl BusinessLookup for InMemoryCatalog {
    async fn get_business(&self, id: &str) -> Result<Option<Business>, CatalogError> {
        Ok(self.businesses.get(id).map(|e| e.value().clone()))
    }

    async fn businesses_by_provider(
        &self,
        provider_id: &str,
    ) -> Result<Vec<Business>, CatalogError> {
        let mut found: Vec<Business> = self
            .businesses
            .iter()
            .filter(|e| e.value().provider_id == provider_id)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

#[async_trait]
impl ProfileLookup for InMemoryCatalog {
    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, CatalogError> {
        Ok(self.profiles.get(id).map(|e| e.value().clone()))
    }

    async fn get_profile_by_email(&self, email: &str) -> Result<Option<Profile>, CatalogError> {
        Ok(self
            .profiles
            .iter()
            .find(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| e.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserType;

    const SEED: &str = r#"{
        "profiles": [
            {"id": "p1", "email": "Pat@Example.com", "full_name": "Pat", "user_type": "provider"},
            {"id": "c1", "email": "cam@example.com", "full_name": "Cam", "user_type": "client"}
        ],
        "businesses": [
            {"id": "b2", "provider_id": "p1", "business_name": "Second"},
            {"id": "b1", "provider_id": "p1", "business_name": "First", "city": "Lisbon"}
        ],
        "services": [
            {"id": "s1", "business_id": "b1", "name": "Cut", "price": 5000, "duration_minutes": 60}
        ]
    }"#;

    fn seeded() -> InMemoryCatalog {
        InMemoryCatalog::from_seed(serde_json::from_str(SEED).unwrap())
    }

    #[test]
    fn seed_defaults_fill_optional_fields() {
        let catalog = seeded();
        assert_eq!(catalog.counts(), (2, 2, 1));
        let svc = tokio_test::block_on(catalog.get_service("s1")).unwrap().unwrap();
        assert!(svc.is_active);
        assert!(svc.tags.is_empty());
        let biz = tokio_test::block_on(catalog.get_business("b2")).unwrap().unwrap();
        assert!(biz.is_active);
        assert_eq!(biz.city, "");
    }

    #[test]
    fn businesses_by_provider_sorted_by_id() {
        let catalog = seeded();
        let found = tokio_test::block_on(catalog.businesses_by_provider("p1")).unwrap();
        let ids: Vec<_> = found.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
        let none = tokio_test::block_on(catalog.businesses_by_provider("c1")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn profile_by_email_is_case_insensitive() {
        let catalog = seeded();
        let p = tokio_test::block_on(catalog.get_profile_by_email("pat@example.com"))
            .unwrap()
            .unwrap();
        assert_eq!(p.id, "p1");
        assert_eq!(p.user_type, UserType::Provider);
        assert!(tokio_test::block_on(catalog.get_profile("nobody")).unwrap().is_none());
    }

    #[test]
    fn load_missing_file_is_seed_error() {
        let path = std::env::temp_dir().join("bookspot_test_catalog_missing.json");
        let _ = std::fs::remove_file(&path);
        let result = InMemoryCatalog::load(&path);
        assert!(matches!(result, Err(CatalogError::Seed(_))));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join("bookspot_test_catalog_load.json");
        std::fs::write(&path, SEED).unwrap();
        let catalog = InMemoryCatalog::load(&path).unwrap();
        assert_eq!(catalog.counts(), (2, 2, 1));
        let _ = std::fs::remove_file(&path);
    }
}
