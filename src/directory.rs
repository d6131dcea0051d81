// User directory: who may administer tickets and who may hold them

use crate::store::Store;
use crate::user::User;
use eyre::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Resolves actor capabilities for the service layer
pub trait UserDirectory {
    /// True if `actor_id` holds the elevated role
    fn is_admin(&self, actor_id: &str) -> Result<bool>;

    /// True if `actor_id` may be assigned tickets
    ///
    /// Defaults to the elevated-role check.
    fn is_eligible_assignee(&self, actor_id: &str) -> Result<bool> {
        self.is_admin(actor_id)
    }
}

/// Directory backed by the `users` collection of a store
pub struct StoreDirectory {
    store: Store,
}

impl StoreDirectory {
    /// Open a dedicated store connection for directory lookups
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            store: Store::open(path)?,
        })
    }

    pub fn user(&self, actor_id: &str) -> Result<Option<User>> {
        self.store.get::<User>(actor_id)
    }
}

impl UserDirectory for StoreDirectory {
    fn is_admin(&self, actor_id: &str) -> Result<bool> {
        let admin = self.user(actor_id)?.is_some_and(|user| user.is_admin());
        debug!(actor_id, admin, "Directory lookup");
        Ok(admin)
    }
}

/// Fixed role table, for tests and embedding without a store
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    admins: HashMap<String, bool>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin(mut self, actor_id: impl Into<String>) -> Self {
        self.admins.insert(actor_id.into(), true);
        self
    }

    pub fn with_member(mut self, actor_id: impl Into<String>) -> Self {
        self.admins.insert(actor_id.into(), false);
        self
    }
}

impl UserDirectory for StaticDirectory {
    fn is_admin(&self, actor_id: &str) -> Result<bool> {
        Ok(self.admins.get(actor_id).copied().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Role;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_store_directory_roles() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        store.create(User::new("ops", "Ops Lead", Role::Admin, Utc::now())).unwrap();
        store.create(User::new("carol", "Carol", Role::Member, Utc::now())).unwrap();

        let directory = StoreDirectory::open(temp.path()).unwrap();
        assert!(directory.is_admin("ops").unwrap());
        assert!(!directory.is_admin("carol").unwrap());
        assert!(!directory.is_admin("ghost").unwrap());
        assert!(directory.is_eligible_assignee("ops").unwrap());
        assert!(!directory.is_eligible_assignee("carol").unwrap());
    }

    #[test]
    fn test_static_directory() {
        let directory = StaticDirectory::new().with_admin("ops").with_member("carol");
        assert!(directory.is_admin("ops").unwrap());
        assert!(!directory.is_admin("carol").unwrap());
        assert!(!directory.is_admin("unknown").unwrap());
    }
}
