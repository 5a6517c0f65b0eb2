use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use ulid::Ulid;

use crate::limits::MAX_AMENITY_NAME_LEN;
use crate::model::Amenity;

/// Read-only amenity lookup. Amenity CRUD lives with the administrative collaborator.
#[async_trait]
pub trait AmenityCatalog: Send + Sync {
    async fn get_amenity(&self, id: Ulid) -> Option<Amenity>;
}

/// Catalog fixed at startup, loaded from a JSON array of amenities.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    amenities: HashMap<Ulid, Amenity>,
}

impl StaticCatalog {
    pub fn new(amenities: impl IntoIterator<Item = Amenity>) -> Result<Self, CatalogError> {
        let mut map = HashMap::new();
        for amenity in amenities {
            if amenity.capacity == 0 {
                return Err(CatalogError::Invalid(amenity.id, "capacity must be positive"));
            }
            if amenity.max_duration_minutes == 0 {
                return Err(CatalogError::Invalid(amenity.id, "max_duration_minutes must be positive"));
            }
            if amenity.name.len() > MAX_AMENITY_NAME_LEN {
                return Err(CatalogError::Invalid(amenity.id, "name too long"));
            }
            if map.insert(amenity.id, amenity.clone()).is_some() {
                return Err(CatalogError::Duplicate(amenity.id));
            }
        }
        Ok(Self { amenities: map })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let amenities: Vec<Amenity> =
            serde_json::from_str(json).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(amenities)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn len(&self) -> usize {
        self.amenities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amenities.is_empty()
    }
}

#[async_trait]
impl AmenityCatalog for StaticCatalog {
    async fn get_amenity(&self, id: Ulid) -> Option<Amenity> {
        self.amenities.get(&id).cloned()
    }
}

#[derive(Debug)]
pub enum CatalogError {
    Io(String),
    Parse(String),
    Duplicate(Ulid),
    Invalid(Ulid, &'static str),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "cannot read catalog: {e}"),
            CatalogError::Parse(e) => write!(f, "malformed catalog: {e}"),
            CatalogError::Duplicate(id) => write!(f, "duplicate amenity id: {id}"),
            CatalogError::Invalid(id, msg) => write!(f, "amenity {id}: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}
