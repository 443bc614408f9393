use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::validation::validate_category_name;
use super::{Catalog, require_roles, resolve_stamp};
use crate::error::{Error, Result};
use crate::types::{Actor, Category, ListQuery, Page, Role, timestamp_now};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateCategory {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Catalog {
    pub fn create_category(&self, request: &CreateCategory, actor: &Actor) -> Result<Category> {
        require_roles(actor, Role::ADMIN, "create categories")?;
        let name = request.name.trim();
        validate_category_name(name)?;

        let now = timestamp_now();
        let category = Category {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: request.description.clone(),
            created_at: now,
            updated_at: now,
            stamp: 1,
        };
        self.store.create_category(&category)?;
        tracing::info!(id = %category.id, name = %category.name, "category created");
        Ok(category)
    }

    pub fn describe_category(&self, id: &str) -> Result<Category> {
        self.store
            .get_category(id)?
            .ok_or_else(|| Error::not_found(format!("category {id}")))
    }

    pub fn list_categories(&self, query: &ListQuery) -> Result<Page<Category>> {
        self.store.list_categories(query)
    }

    pub fn patch_category(
        &self,
        id: &str,
        patch: &CategoryPatch,
        expected_stamp: Option<i64>,
        actor: &Actor,
    ) -> Result<Category> {
        require_roles(actor, Role::ADMIN, "modify categories")?;
        let current = self.describe_category(id)?;
        let stamp = resolve_stamp(current.stamp, expected_stamp, "category")?;

        let mut next = current;
        if let Some(name) = &patch.name {
            validate_category_name(name.trim())?;
            next.name = name.trim().to_string();
        }
        if let Some(description) = &patch.description {
            next.description = Some(description.clone());
        }
        self.store.update_category(&next, stamp)
    }

    /// Fails with `Conflict` while a live template still uses the category.
    pub fn delete_category(&self, id: &str, actor: &Actor) -> Result<()> {
        require_roles(actor, Role::ADMIN, "delete categories")?;
        if !self.store.delete_category(id)? {
            return Err(Error::not_found(format!("category {id}")));
        }
        tracing::info!(id, "category deleted");
        Ok(())
    }
}
