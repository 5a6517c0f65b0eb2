use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::catalog::CatalogError;
use crate::model::{Principal, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Resident
}

impl UserProfile {
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.id,
            role: self.role,
        }
    }
}

/// Identity lookup. Resolves callers and email recipients.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn profile(&self, user_id: Ulid) -> Option<UserProfile>;
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: HashMap<Ulid, UserProfile>,
}

impl StaticDirectory {
    pub fn new(users: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id, u)).collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let users: Vec<UserProfile> =
            serde_json::from_str(json).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Ok(Self::new(users))
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn profile(&self, user_id: Ulid) -> Option<UserProfile> {
        self.users.get(&user_id).cloned()
    }
}
