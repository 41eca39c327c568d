//! Permission resolution: which named accesses a user holds, directly or
//! through the groups it belongs to.
//!
//! Groups do not nest, so a user's effective set is the union of its own
//! access levels and the access levels of each of its groups. Names are the
//! dedup key.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::{Access, AccessId, AccessLevel, GroupId, Subject, UserId};
use crate::store::IdentityStore;

/// Catalogue seeded into an empty store.
pub const DEFAULT_PERMISSIONS: &[(&str, &str)] = &[
    ("user:create", "Create users"),
    ("user:read", "Read user information"),
    ("user:update", "Update user information"),
    ("user:delete", "Delete users"),
    ("group:create", "Create groups"),
    ("group:read", "Read group information"),
    ("group:update", "Update group information"),
    ("group:delete", "Delete groups"),
    ("access:create", "Create accesses"),
    ("access:read", "Read access information"),
    ("access:update", "Update access information"),
    ("access:delete", "Delete accesses"),
    ("user_access:set", "Grant and revoke user accesses"),
    ("group_access:set", "Grant and revoke group accesses"),
];

#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn IdentityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn ensure_subject(&self, subject: Subject) -> Result<()> {
        let exists = match subject {
            Subject::User(id) => self.store.get_user(id).await?.is_some(),
            Subject::Group(id) => self.store.get_group(id).await?.is_some(),
        };
        if exists {
            Ok(())
        } else {
            Err(AppError::not_found(subject))
        }
    }

    async fn access_named(&self, name: &str) -> Result<Access> {
        self.store
            .find_access_by_name(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("access {}", name)))
    }

    /// Subjects whose access levels count for `user_id`: the user itself, then its groups.
    async fn subjects_of_user(&self, user_id: UserId) -> Result<Vec<Subject>> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(AppError::not_found(format!("user {}", user_id)));
        }
        let mut subjects = vec![Subject::User(user_id)];
        subjects.extend(
            self.store
                .groups_of_user(user_id)
                .await?
                .into_iter()
                .map(Subject::Group),
        );
        Ok(subjects)
    }

    async fn names_of(&self, levels: Vec<AccessLevel>) -> Result<BTreeSet<String>> {
        if levels.is_empty() {
            return Ok(BTreeSet::new());
        }
        let catalogue: HashMap<AccessId, String> = self
            .store
            .list_accesses()
            .await?
            .into_iter()
            .map(|a| (a.id, a.name))
            .collect();
        // Levels pointing at a vanished access are skipped.
        Ok(levels
            .iter()
            .filter_map(|l| catalogue.get(&l.access_id).cloned())
            .collect())
    }

    async fn levels_of_all(&self, subjects: &[Subject]) -> Result<Vec<AccessLevel>> {
        let mut levels = Vec::new();
        for subject in subjects {
            levels.extend(self.store.access_levels_of(*subject).await?);
        }
        Ok(levels)
    }

    /// True if the user, or any group it belongs to, holds `permission`.
    /// An unknown permission name is simply not held.
    pub async fn has_permission(&self, user_id: UserId, permission: &str) -> Result<bool> {
        let subjects = self.subjects_of_user(user_id).await?;
        let Some(access) = self.store.find_access_by_name(permission).await? else {
            debug!("Permission {} is not defined", permission);
            return Ok(false);
        };
        for subject in subjects {
            let levels = self.store.access_levels_of(subject).await?;
            if levels.iter().any(|l| l.access_id == access.id) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Direct and group-inherited permission names.
    pub async fn effective_permissions(&self, user_id: UserId) -> Result<BTreeSet<String>> {
        let subjects = self.subjects_of_user(user_id).await?;
        let levels = self.levels_of_all(&subjects).await?;
        self.names_of(levels).await
    }

    /// Permissions attached to the user itself, ignoring its groups.
    pub async fn direct_permissions(&self, user_id: UserId) -> Result<BTreeSet<String>> {
        self.ensure_subject(Subject::User(user_id)).await?;
        let levels = self.store.access_levels_of(Subject::User(user_id)).await?;
        self.names_of(levels).await
    }

    pub async fn group_permissions(&self, group_id: GroupId) -> Result<BTreeSet<String>> {
        self.ensure_subject(Subject::Group(group_id)).await?;
        let levels = self.store.access_levels_of(Subject::Group(group_id)).await?;
        self.names_of(levels).await
    }

    /// Attaches `permission` to `subject`. Holding it already is a `Conflict`.
    pub async fn grant(&self, subject: Subject, permission: &str) -> Result<()> {
        self.ensure_subject(subject).await?;
        let access = self.access_named(permission).await?;
        let level = AccessLevel {
            id: Uuid::new_v4(),
            access_id: access.id,
            subject,
            created_at: self.clock.now(),
        };
        self.store.insert_access_level(&level).await?;
        info!("Granted {} to {}", permission, subject);
        Ok(())
    }

    pub async fn revoke(&self, subject: Subject, permission: &str) -> Result<()> {
        let access = self.access_named(permission).await?;
        if !self.store.delete_access_level(subject, access.id).await? {
            return Err(AppError::not_found(format!("{} does not hold {}", subject, permission)));
        }
        info!("Revoked {} from {}", permission, subject);
        Ok(())
    }

    pub async fn add_direct_permission(&self, user_id: UserId, permission: &str) -> Result<()> {
        self.grant(Subject::User(user_id), permission).await
    }

    pub async fn remove_direct_permission(&self, user_id: UserId, permission: &str) -> Result<()> {
        self.revoke(Subject::User(user_id), permission).await
    }

    pub async fn add_group_permission(&self, group_id: GroupId, permission: &str) -> Result<()> {
        self.grant(Subject::Group(group_id), permission).await
    }

    pub async fn remove_group_permission(&self, group_id: GroupId, permission: &str) -> Result<()> {
        self.revoke(Subject::Group(group_id), permission).await
    }

    /// Inserts every catalogue entry that is not present yet. Returns how many were created.
    pub async fn seed_default_permissions(&self) -> Result<usize> {
        let mut created = 0;
        for (name, description) in DEFAULT_PERMISSIONS {
            if self.store.find_access_by_name(name).await?.is_some() {
                continue;
            }
            let access = Access {
                id: Uuid::new_v4(),
                name: name.to_string(),
                description: description.to_string(),
            };
            match self.store.insert_access(&access).await {
                Ok(()) => created += 1,
                // Another seeder got there first.
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        if created > 0 {
            info!("Seeded {} default permissions", created);
        }
        Ok(created)
    }

    /// Seeds the catalogue only when no access exists at all.
    pub async fn bootstrap(&self) -> Result<usize> {
        if self.store.count_accesses().await? > 0 {
            return Ok(0);
        }
        self.seed_default_permissions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::models::{Group, User, UserType};
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    async fn setup() -> (Arc<MemoryStore>, PermissionResolver) {
        let store = Arc::new(MemoryStore::new());
        let resolver = PermissionResolver::new(store.clone(), Arc::new(SystemClock));
        resolver.seed_default_permissions().await.unwrap();
        (store, resolver)
    }

    async fn add_user(store: &MemoryStore, email: &str) -> UserId {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: String::new(),
            name: "U".into(),
            user_type: UserType::User,
            email_validated: true,
            email_validation_token: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_user(&user).await.unwrap();
        user.id
    }

    async fn add_group(store: &MemoryStore, name: &str) -> GroupId {
        let group = Group { id: Uuid::new_v4(), name: name.into(), created_at: Utc::now() };
        store.insert_group(&group).await.unwrap();
        group.id
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn grant_then_revoke_direct_permission() {
        let (store, resolver) = setup().await;
        let user = add_user(&store, "a@example.com").await;

        resolver.add_direct_permission(user, "user:read").await.unwrap();
        assert!(resolver.has_permission(user, "user:read").await.unwrap());
        assert!(!resolver.has_permission(user, "user:write").await.unwrap());

        resolver.remove_direct_permission(user, "user:read").await.unwrap();
        assert!(!resolver.has_permission(user, "user:read").await.unwrap());
    }

    #[tokio::test]
    async fn inherits_from_groups() {
        let (store, resolver) = setup().await;
        let user = add_user(&store, "a@example.com").await;
        let group = add_group(&store, "editors").await;
        store.add_membership(user, group).await.unwrap();

        resolver.add_group_permission(group, "group:read").await.unwrap();
        assert!(resolver.has_permission(user, "group:read").await.unwrap());
        assert!(resolver.direct_permissions(user).await.unwrap().is_empty());

        store.remove_membership(user, group).await.unwrap();
        assert!(!resolver.has_permission(user, "group:read").await.unwrap());
    }

    #[tokio::test]
    async fn effective_set_is_union_deduplicated_by_name() {
        let (store, resolver) = setup().await;
        let user = add_user(&store, "a@example.com").await;
        let g1 = add_group(&store, "one").await;
        let g2 = add_group(&store, "two").await;
        store.replace_memberships(user, &[g1, g2]).await.unwrap();

        resolver.add_direct_permission(user, "user:read").await.unwrap();
        resolver.add_group_permission(g1, "user:read").await.unwrap();
        resolver.add_group_permission(g1, "group:read").await.unwrap();
        resolver.add_group_permission(g2, "group:read").await.unwrap();
        resolver.add_group_permission(g2, "access:read").await.unwrap();

        let direct = resolver.direct_permissions(user).await.unwrap();
        let mut expected = direct.clone();
        expected.extend(resolver.group_permissions(g1).await.unwrap());
        expected.extend(resolver.group_permissions(g2).await.unwrap());

        let effective = resolver.effective_permissions(user).await.unwrap();
        assert_eq!(effective, expected);
        assert_eq!(effective, names(&["access:read", "group:read", "user:read"]));
    }

    #[tokio::test]
    async fn duplicate_grant_is_conflict() {
        let (store, resolver) = setup().await;
        let user = add_user(&store, "a@example.com").await;
        resolver.add_direct_permission(user, "user:read").await.unwrap();
        let err = resolver.add_direct_permission(user, "user:read").await.unwrap_err();
        assert!(err.is_conflict());
        // Still held exactly once.
        assert_eq!(store.access_levels_of(Subject::User(user)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn grant_and_revoke_report_missing_things() {
        let (store, resolver) = setup().await;
        let user = add_user(&store, "a@example.com").await;

        assert!(resolver.add_direct_permission(user, "nope").await.unwrap_err().is_not_found());
        assert!(resolver
            .add_direct_permission(Uuid::new_v4(), "user:read")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(resolver.remove_direct_permission(user, "user:read").await.unwrap_err().is_not_found());
        assert!(resolver.remove_direct_permission(user, "nope").await.unwrap_err().is_not_found());
        assert!(resolver.group_permissions(Uuid::new_v4()).await.unwrap_err().is_not_found());
        assert!(resolver.has_permission(Uuid::new_v4(), "user:read").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let (store, resolver) = setup().await;
        assert_eq!(resolver.seed_default_permissions().await.unwrap(), 0);
        assert_eq!(store.count_accesses().await.unwrap(), DEFAULT_PERMISSIONS.len());
        let listed: BTreeSet<String> = store.list_accesses().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(listed.len(), 14);
    }

    #[tokio::test]
    async fn bootstrap_only_seeds_empty_store() {
        let store = Arc::new(MemoryStore::new());
        let resolver = PermissionResolver::new(store.clone(), Arc::new(SystemClock));
        store
            .insert_access(&Access { id: Uuid::new_v4(), name: "custom".into(), description: String::new() })
            .await
            .unwrap();
        assert_eq!(resolver.bootstrap().await.unwrap(), 0);
        assert_eq!(store.count_accesses().await.unwrap(), 1);

        let fresh = PermissionResolver::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        assert_eq!(fresh.bootstrap().await.unwrap(), DEFAULT_PERMISSIONS.len());
        assert_eq!(fresh.bootstrap().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleted_access_disappears_from_effective_set() {
        let (store, resolver) = setup().await;
        let user = add_user(&store, "a@example.com").await;
        resolver.add_direct_permission(user, "access:delete").await.unwrap();
        let access = store.find_access_by_name("access:delete").await.unwrap().unwrap();
        store.delete_access(access.id).await.unwrap();
        assert!(resolver.effective_permissions(user).await.unwrap().is_empty());
        assert!(!resolver.has_permission(user, "access:delete").await.unwrap());
    }

    #[tokio::test]
    async fn grants_are_stamped_with_the_injected_clock() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        clock.advance(Duration::days(400));
        let resolver = PermissionResolver::new(store.clone(), clock.clone());
        resolver.seed_default_permissions().await.unwrap();
        let user = add_user(&store, "a@example.com").await;

        resolver.add_direct_permission(user, "user:read").await.unwrap();
        let levels = store.access_levels_of(Subject::User(user)).await.unwrap();
        assert_eq!(levels[0].created_at, clock.now());
    }
}
