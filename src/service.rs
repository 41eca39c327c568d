//! User, group and access management on top of an [`IdentityStore`].

use email_address::EmailAddress;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::ids::IdGenerator;
use crate::models::{Access, AccessId, Group, GroupId, Subject, User, UserId, UserType};
use crate::password::CredentialHasher;
use crate::resolver::PermissionResolver;
use crate::store::IdentityStore;

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub name: String,
    pub user_type: UserType,
}

/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub user_type: Option<UserType>,
}

/// Outcome of granting the whole catalogue to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminProvisioning {
    pub user_id: UserId,
    /// Newly granted in this call.
    pub granted: Vec<String>,
    /// Held before this call.
    pub already_held: Vec<String>,
}

#[derive(Clone)]
pub struct AccessService {
    store: Arc<dyn IdentityStore>,
    resolver: PermissionResolver,
    hasher: Arc<dyn CredentialHasher>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    require_email_validation: bool,
    // Verified against when the email is unknown, so both failures cost the same.
    dummy_hash: Arc<OnceCell<String>>,
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    if !EmailAddress::is_valid(&email) {
        return Err(AppError::ValidationFailed(format!("'{}' is not a valid email address", email)));
    }
    Ok(email)
}

fn require_non_empty(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::ValidationFailed(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

impl AccessService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        hasher: Arc<dyn CredentialHasher>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Built up front so the first unknown-email login costs one verify like any other.
        let dummy_hash = OnceCell::new();
        match hasher.hash(&ids.new_id()) {
            Ok(hash) => {
                let _ = dummy_hash.set(hash);
            }
            Err(e) => warn!("Dummy credential hash not prepared, retrying on first use: {}", e),
        }
        Self {
            resolver: PermissionResolver::new(store.clone(), clock.clone()),
            store,
            hasher,
            ids,
            clock,
            require_email_validation: true,
            dummy_hash: Arc::new(dummy_hash),
        }
    }

    pub fn with_email_validation(mut self, required: bool) -> Self {
        self.require_email_validation = required;
        self
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    /// Seeds the default catalogue when the store has no accesses yet.
    pub async fn bootstrap(&self) -> Result<usize> {
        self.resolver.bootstrap().await
    }

    // ---- users ----

    pub async fn create_user(&self, new_user: NewUser) -> Result<User> {
        let email = normalize_email(&new_user.email)?;
        let name = require_non_empty("name", &new_user.name)?;
        if new_user.password.is_empty() {
            return Err(AppError::ValidationFailed("password is required".into()));
        }
        let now = self.clock.now();
        let user = User {
            id: Uuid::new_v4(),
            email,
            password_hash: self.hasher.hash(&new_user.password)?,
            name,
            user_type: new_user.user_type,
            email_validated: false,
            email_validation_token: Some(self.ids.new_id()),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_user(&user).await?;
        info!("Created {} user {} ({})", user.user_type, user.id, user.email);
        Ok(user)
    }

    pub async fn update_user(&self, user_id: UserId, update: UserUpdate) -> Result<User> {
        let mut user = self.get_user(user_id).await?;
        if let Some(email) = update.email {
            user.email = normalize_email(&email)?;
        }
        if let Some(name) = update.name {
            user.name = require_non_empty("name", &name)?;
        }
        if let Some(user_type) = update.user_type {
            user.user_type = user_type;
        }
        if let Some(password) = update.password.filter(|p| !p.is_empty()) {
            user.password_hash = self.hasher.hash(&password)?;
        }
        user.updated_at = self.clock.now();
        self.store.update_user(&user).await?;
        Ok(user)
    }

    pub async fn delete_user(&self, user_id: UserId) -> Result<()> {
        if !self.store.delete_user(user_id).await? {
            return Err(AppError::not_found(format!("user {}", user_id)));
        }
        info!("Deleted user {}", user_id);
        Ok(())
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("user {}", user_id)))
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        self.store
            .find_user_by_email(&email)
            .await?
            .ok_or_else(|| AppError::not_found(format!("user {}", email)))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.store.list_users().await
    }

    /// Marks the owner of `token` as validated and consumes the token.
    pub async fn validate_email(&self, token: &str) -> Result<User> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::ValidationFailed("token is required".into()));
        }
        let mut user = self
            .store
            .find_user_by_validation_token(token)
            .await?
            .ok_or_else(|| AppError::not_found("validation token"))?;
        user.email_validated = true;
        user.email_validation_token = None;
        user.updated_at = self.clock.now();
        self.store.update_user(&user).await?;
        info!("Validated email of user {}", user.id);
        Ok(user)
    }

    pub async fn change_password(&self, user_id: UserId, current: &str, new: &str) -> Result<()> {
        let user = self.get_user(user_id).await?;
        if !self.hasher.verify(current, &user.password_hash)? {
            return Err(AppError::InvalidCredentials);
        }
        if new.is_empty() {
            return Err(AppError::ValidationFailed("password is required".into()));
        }
        self.update_user(user_id, UserUpdate { password: Some(new.to_string()), ..Default::default() })
            .await?;
        Ok(())
    }

    // ---- groups ----

    pub async fn create_group(&self, name: &str) -> Result<Group> {
        let group = Group {
            id: Uuid::new_v4(),
            name: require_non_empty("group name", name)?,
            created_at: self.clock.now(),
        };
        self.store.insert_group(&group).await?;
        info!("Created group {} ({})", group.id, group.name);
        Ok(group)
    }

    pub async fn update_group(&self, group_id: GroupId, name: &str) -> Result<Group> {
        let mut group = self.get_group(group_id).await?;
        group.name = require_non_empty("group name", name)?;
        self.store.update_group(&group).await?;
        Ok(group)
    }

    pub async fn delete_group(&self, group_id: GroupId) -> Result<()> {
        if !self.store.delete_group(group_id).await? {
            return Err(AppError::not_found(format!("group {}", group_id)));
        }
        info!("Deleted group {}", group_id);
        Ok(())
    }

    pub async fn get_group(&self, group_id: GroupId) -> Result<Group> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("group {}", group_id)))
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        self.store.list_groups().await
    }

    // ---- accesses ----

    pub async fn create_access(&self, name: &str, description: &str) -> Result<Access> {
        let access = Access {
            id: Uuid::new_v4(),
            name: require_non_empty("access name", name)?,
            description: description.trim().to_string(),
        };
        self.store.insert_access(&access).await?;
        info!("Created access {}", access.name);
        Ok(access)
    }

    pub async fn update_access(&self, access_id: AccessId, name: &str, description: &str) -> Result<Access> {
        let mut access = self
            .store
            .get_access(access_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("access {}", access_id)))?;
        access.name = require_non_empty("access name", name)?;
        access.description = description.trim().to_string();
        self.store.update_access(&access).await?;
        Ok(access)
    }

    pub async fn delete_access(&self, access_id: AccessId) -> Result<()> {
        if !self.store.delete_access(access_id).await? {
            return Err(AppError::not_found(format!("access {}", access_id)));
        }
        info!("Deleted access {}", access_id);
        Ok(())
    }

    pub async fn get_access_by_name(&self, name: &str) -> Result<Access> {
        self.store
            .find_access_by_name(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("access {}", name)))
    }

    pub async fn list_accesses(&self) -> Result<Vec<Access>> {
        self.store.list_accesses().await
    }

    // ---- membership ----

    pub async fn assign_to_group(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        self.get_user(user_id).await?;
        self.get_group(group_id).await?;
        self.store.add_membership(user_id, group_id).await
    }

    pub async fn remove_from_group(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        self.get_user(user_id).await?;
        self.get_group(group_id).await?;
        self.store.remove_membership(user_id, group_id).await?;
        Ok(())
    }

    /// Replaces the user's memberships. Every id is checked before anything changes.
    pub async fn set_groups(&self, user_id: UserId, group_ids: &[GroupId]) -> Result<()> {
        self.get_user(user_id).await?;
        let wanted: BTreeSet<GroupId> = group_ids.iter().copied().collect();
        for group_id in &wanted {
            if self.store.get_group(*group_id).await?.is_none() {
                return Err(AppError::not_found(format!("group {}", group_id)));
            }
        }
        let wanted: Vec<GroupId> = wanted.into_iter().collect();
        self.store.replace_memberships(user_id, &wanted).await?;
        info!("User {} now belongs to {} groups", user_id, wanted.len());
        Ok(())
    }

    pub async fn user_groups(&self, user_id: UserId) -> Result<Vec<Group>> {
        self.get_user(user_id).await?;
        let mut groups = Vec::new();
        for group_id in self.store.groups_of_user(user_id).await? {
            if let Some(group) = self.store.get_group(group_id).await? {
                groups.push(group);
            }
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    pub async fn group_users(&self, group_id: GroupId) -> Result<Vec<User>> {
        self.get_group(group_id).await?;
        let mut users = Vec::new();
        for user_id in self.store.users_of_group(group_id).await? {
            if let Some(user) = self.store.get_user(user_id).await? {
                users.push(user);
            }
        }
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    // ---- admin provisioning ----

    /// Creates an admin user and grants it every access currently defined.
    pub async fn create_default_admin(&self, email: &str, password: &str, name: &str) -> Result<AdminProvisioning> {
        let mut admin = self
            .create_user(NewUser {
                email: email.to_string(),
                password: password.to_string(),
                name: name.to_string(),
                user_type: UserType::Admin,
            })
            .await?;
        // A provisioned admin can log in without a validation round-trip.
        admin.email_validated = true;
        admin.email_validation_token = None;
        self.store.update_user(&admin).await?;
        self.grant_all_permissions(admin.id).await
    }

    /// Grants the whole catalogue. Safe to retry: permissions already held are
    /// skipped. Any other failure stops with [`AppError::PartialGrant`].
    pub async fn grant_all_permissions(&self, user_id: UserId) -> Result<AdminProvisioning> {
        self.get_user(user_id).await?;
        let mut outcome = AdminProvisioning { user_id, granted: Vec::new(), already_held: Vec::new() };
        for access in self.store.list_accesses().await? {
            match self.resolver.grant(Subject::User(user_id), &access.name).await {
                Ok(()) => outcome.granted.push(access.name),
                Err(e) if e.is_conflict() => outcome.already_held.push(access.name),
                Err(e) => {
                    warn!("Granting {} to {} failed: {}", access.name, user_id, e);
                    return Err(AppError::PartialGrant {
                        user_id,
                        access: access.name,
                        granted: outcome.granted,
                        source: Box::new(e),
                    });
                }
            }
        }
        info!(
            "User {} holds the full catalogue ({} new, {} already held)",
            user_id,
            outcome.granted.len(),
            outcome.already_held.len()
        );
        Ok(outcome)
    }

    // ---- authentication ----

    fn dummy_hash(&self) -> Result<&str> {
        self.dummy_hash
            .get_or_try_init(|| self.hasher.hash(&self.ids.new_id()))
            .map(String::as_str)
    }

    /// Unknown email and wrong password both yield `InvalidCredentials`, and
    /// both pay for one hash verification.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        let Some(user) = self.store.find_user_by_email(&email).await? else {
            let _ = self.hasher.verify(password, self.dummy_hash()?)?;
            warn!("Authentication failed for unknown email");
            return Err(AppError::InvalidCredentials);
        };
        if !self.hasher.verify(password, &user.password_hash)? {
            warn!("Authentication failed for user {}", user.id);
            return Err(AppError::InvalidCredentials);
        }
        if user.user_type == UserType::Blocked {
            warn!("Blocked user {} attempted to log in", user.id);
            return Err(AppError::InvalidCredentials);
        }
        if self.require_email_validation && !user.email_validated {
            return Err(AppError::EmailNotValidated);
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::ids::UuidIds;
    use crate::password::Argon2Hasher;
    use crate::resolver::DEFAULT_PERMISSIONS;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service_on(store: Arc<dyn IdentityStore>) -> AccessService {
        AccessService::new(
            store,
            Arc::new(Argon2Hasher::with_cost(8, 1, 1).unwrap()),
            Arc::new(UuidIds),
            Arc::new(SystemClock),
        )
    }

    async fn service() -> AccessService {
        let service = service_on(Arc::new(MemoryStore::new()));
        service.bootstrap().await.unwrap();
        service
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            password: "password".to_string(),
            name: "Test User".to_string(),
            user_type: UserType::User,
        }
    }

    #[tokio::test]
    async fn creates_user_with_token() {
        let service = service().await;
        let user = service.create_user(new_user("Test@Example.com ")).await.unwrap();
        assert_eq!(user.email, "test@example.com");
        assert_eq!(user.name, "Test User");
        assert_eq!(user.user_type, UserType::User);
        assert!(!user.email_validated);
        assert!(user.email_validation_token.is_some());
        assert_ne!(user.password_hash, "password");
    }

    #[tokio::test]
    async fn rejects_bad_input_and_duplicates() {
        let service = service().await;
        let err = service.create_user(new_user("not-an-email")).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed(_)));
        let mut blank = new_user("x@example.com");
        blank.name = "  ".into();
        assert!(matches!(service.create_user(blank).await, Err(AppError::ValidationFailed(_))));

        service.create_user(new_user("dup@example.com")).await.unwrap();
        assert!(service.create_user(new_user("dup@example.com")).await.unwrap_err().is_conflict());
        service.create_group("ops").await.unwrap();
        assert!(service.create_group("ops").await.unwrap_err().is_conflict());
        assert!(service.create_access("user:read", "").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn update_and_delete_user() {
        let service = service().await;
        let user = service.create_user(new_user("update@example.com")).await.unwrap();
        let updated = service
            .update_user(
                user.id,
                UserUpdate {
                    email: Some("newemail@example.com".into()),
                    password: Some("newpassword".into()),
                    name: Some("New Name".into()),
                    user_type: Some(UserType::Employee),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.email, "newemail@example.com");
        assert_eq!(updated.name, "New Name");
        assert_eq!(updated.user_type, UserType::Employee);
        assert_ne!(updated.password_hash, user.password_hash);

        service.delete_user(user.id).await.unwrap();
        assert!(service.get_user_by_email("newemail@example.com").await.unwrap_err().is_not_found());
        assert!(service.delete_user(user.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn validate_email_consumes_token() {
        let service = service().await;
        let user = service.create_user(new_user("v@example.com")).await.unwrap();
        let token = user.email_validation_token.clone().unwrap();

        assert!(matches!(service.validate_email("").await, Err(AppError::ValidationFailed(_))));
        assert!(service.validate_email("bogus").await.unwrap_err().is_not_found());

        let validated = service.validate_email(&token).await.unwrap();
        assert!(validated.email_validated);
        assert!(validated.email_validation_token.is_none());
        assert!(service.validate_email(&token).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn authentication_paths() {
        let service = service().await;
        let user = service.create_user(new_user("auth@example.com")).await.unwrap();

        assert!(matches!(
            service.authenticate("auth@example.com", "password").await,
            Err(AppError::EmailNotValidated)
        ));
        service.validate_email(user.email_validation_token.as_deref().unwrap()).await.unwrap();

        let authed = service.authenticate("AUTH@example.com", "password").await.unwrap();
        assert_eq!(authed.id, user.id);

        let wrong = service.authenticate("auth@example.com", "wrongpassword").await.unwrap_err();
        let unknown = service.authenticate("nobody@example.com", "password").await.unwrap_err();
        assert!(matches!(wrong, AppError::InvalidCredentials));
        assert!(matches!(unknown, AppError::InvalidCredentials));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn email_validation_can_be_disabled() {
        let service = service().await.with_email_validation(false);
        service.create_user(new_user("free@example.com")).await.unwrap();
        assert!(service.authenticate("free@example.com", "password").await.is_ok());
    }

    #[tokio::test]
    async fn blocked_users_cannot_authenticate() {
        let service = service().await.with_email_validation(false);
        let user = service.create_user(new_user("b@example.com")).await.unwrap();
        service
            .update_user(user.id, UserUpdate { user_type: Some(UserType::Blocked), ..Default::default() })
            .await
            .unwrap();
        assert!(matches!(
            service.authenticate("b@example.com", "password").await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn change_password_requires_current() {
        let service = service().await.with_email_validation(false);
        let user = service.create_user(new_user("pw@example.com")).await.unwrap();
        assert!(matches!(
            service.change_password(user.id, "nope", "next").await,
            Err(AppError::InvalidCredentials)
        ));
        service.change_password(user.id, "password", "next").await.unwrap();
        assert!(service.authenticate("pw@example.com", "next").await.is_ok());
    }

    #[tokio::test]
    async fn group_membership() {
        let service = service().await;
        let user = service.create_user(new_user("group@example.com")).await.unwrap();
        let group = service.create_group("Test Group").await.unwrap();

        service.assign_to_group(user.id, group.id).await.unwrap();
        let groups = service.user_groups(user.id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, group.id);
        assert_eq!(service.group_users(group.id).await.unwrap()[0].id, user.id);

        assert!(service.assign_to_group(user.id, Uuid::new_v4()).await.unwrap_err().is_not_found());
        assert!(service.assign_to_group(Uuid::new_v4(), group.id).await.unwrap_err().is_not_found());

        service.remove_from_group(user.id, group.id).await.unwrap();
        assert!(service.user_groups(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_groups_is_all_or_nothing() {
        let service = service().await;
        let user = service.create_user(new_user("set@example.com")).await.unwrap();
        let a = service.create_group("a").await.unwrap();
        let b = service.create_group("b").await.unwrap();
        let c = service.create_group("c").await.unwrap();
        service.set_groups(user.id, &[a.id, b.id, a.id]).await.unwrap();
        assert_eq!(service.user_groups(user.id).await.unwrap().len(), 2);

        let err = service.set_groups(user.id, &[c.id, Uuid::new_v4()]).await.unwrap_err();
        assert!(err.is_not_found());
        let names: Vec<String> = service.user_groups(user.id).await.unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        service.set_groups(user.id, &[]).await.unwrap();
        assert!(service.user_groups(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_admin_holds_entire_catalogue() {
        let service = service().await;
        service.create_access("reports:export", "Export reports").await.unwrap();
        let outcome = service.create_default_admin("admin@example.com", "adminpass", "Admin User").await.unwrap();
        assert_eq!(outcome.granted.len(), DEFAULT_PERMISSIONS.len() + 1);

        let admin = service.get_user_by_email("admin@example.com").await.unwrap();
        assert_eq!(admin.user_type, UserType::Admin);
        let catalogue: BTreeSet<String> =
            service.list_accesses().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(service.resolver().effective_permissions(admin.id).await.unwrap(), catalogue);
        assert!(service.authenticate("admin@example.com", "adminpass").await.is_ok());
    }

    #[tokio::test]
    async fn regranting_all_is_idempotent() {
        let service = service().await;
        let outcome = service.create_default_admin("admin@example.com", "adminpass", "Admin").await.unwrap();
        let again = service.grant_all_permissions(outcome.user_id).await.unwrap();
        assert!(again.granted.is_empty());
        assert_eq!(again.already_held.len(), DEFAULT_PERMISSIONS.len());
    }

    /// Memory store that fails the n-th access level insert. With `vanish` set, every
    /// level or membership write first deletes a row the write refers to.
    struct FlakyStore {
        inner: MemoryStore,
        fail_at: usize,
        inserts: AtomicUsize,
        vanish: bool,
    }

    impl FlakyStore {
        fn failing_at(fail_at: usize) -> Self {
            Self { inner: MemoryStore::new(), fail_at, inserts: AtomicUsize::new(0), vanish: false }
        }

        fn vanishing() -> Self {
            Self { vanish: true, ..Self::failing_at(usize::MAX) }
        }
    }

    #[async_trait::async_trait]
    impl IdentityStore for FlakyStore {
        async fn insert_user(&self, user: &User) -> Result<()> { self.inner.insert_user(user).await }
        async fn update_user(&self, user: &User) -> Result<()> { self.inner.update_user(user).await }
        async fn delete_user(&self, id: UserId) -> Result<bool> { self.inner.delete_user(id).await }
        async fn get_user(&self, id: UserId) -> Result<Option<User>> { self.inner.get_user(id).await }
        async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> { self.inner.find_user_by_email(email).await }
        async fn find_user_by_validation_token(&self, token: &str) -> Result<Option<User>> {
            self.inner.find_user_by_validation_token(token).await
        }
        async fn list_users(&self) -> Result<Vec<User>> { self.inner.list_users().await }
        async fn insert_group(&self, group: &Group) -> Result<()> { self.inner.insert_group(group).await }
        async fn update_group(&self, group: &Group) -> Result<()> { self.inner.update_group(group).await }
        async fn delete_group(&self, id: GroupId) -> Result<bool> { self.inner.delete_group(id).await }
        async fn get_group(&self, id: GroupId) -> Result<Option<Group>> { self.inner.get_group(id).await }
        async fn list_groups(&self) -> Result<Vec<Group>> { self.inner.list_groups().await }
        async fn insert_access(&self, access: &Access) -> Result<()> { self.inner.insert_access(access).await }
        async fn update_access(&self, access: &Access) -> Result<()> { self.inner.update_access(access).await }
        async fn delete_access(&self, id: AccessId) -> Result<bool> { self.inner.delete_access(id).await }
        async fn get_access(&self, id: AccessId) -> Result<Option<Access>> { self.inner.get_access(id).await }
        async fn find_access_by_name(&self, name: &str) -> Result<Option<Access>> { self.inner.find_access_by_name(name).await }
        async fn list_accesses(&self) -> Result<Vec<Access>> { self.inner.list_accesses().await }
        async fn count_accesses(&self) -> Result<usize> { self.inner.count_accesses().await }
        async fn insert_access_level(&self, level: &crate::models::AccessLevel) -> Result<()> {
            if self.inserts.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(AppError::Internal("write timeout".into()));
            }
            if self.vanish {
                match level.subject {
                    Subject::User(id) => self.inner.delete_user(id).await?,
                    Subject::Group(id) => self.inner.delete_group(id).await?,
                };
            }
            self.inner.insert_access_level(level).await
        }
        async fn delete_access_level(&self, subject: Subject, access_id: AccessId) -> Result<bool> {
            self.inner.delete_access_level(subject, access_id).await
        }
        async fn access_levels_of(&self, subject: Subject) -> Result<Vec<crate::models::AccessLevel>> {
            self.inner.access_levels_of(subject).await
        }
        async fn add_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
            if self.vanish {
                self.inner.delete_group(group_id).await?;
            }
            self.inner.add_membership(user_id, group_id).await
        }
        async fn remove_membership(&self, user_id: UserId, group_id: GroupId) -> Result<bool> {
            self.inner.remove_membership(user_id, group_id).await
        }
        async fn replace_memberships(&self, user_id: UserId, group_ids: &[GroupId]) -> Result<()> {
            if self.vanish {
                self.inner.delete_user(user_id).await?;
            }
            self.inner.replace_memberships(user_id, group_ids).await
        }
        async fn groups_of_user(&self, user_id: UserId) -> Result<Vec<GroupId>> { self.inner.groups_of_user(user_id).await }
        async fn users_of_group(&self, group_id: GroupId) -> Result<Vec<UserId>> { self.inner.users_of_group(group_id).await }
    }

    #[tokio::test]
    async fn partial_admin_provisioning_is_reported_and_retryable() {
        let store = Arc::new(FlakyStore::failing_at(3));
        let service = service_on(store.clone());
        service.bootstrap().await.unwrap();

        let err = service.create_default_admin("admin@example.com", "pw", "Admin").await.unwrap_err();
        let (user_id, access, granted) = match err {
            AppError::PartialGrant { user_id, access, granted, .. } => (user_id, access, granted),
            other => panic!("expected PartialGrant, got {:?}", other),
        };
        assert_eq!(granted.len(), 3);
        assert!(!granted.contains(&access));

        let retry = service.grant_all_permissions(user_id).await.unwrap();
        assert_eq!(retry.already_held.len(), 3);
        assert_eq!(retry.granted.len(), DEFAULT_PERMISSIONS.len() - 3);
        assert_eq!(
            service.resolver().effective_permissions(user_id).await.unwrap().len(),
            DEFAULT_PERMISSIONS.len()
        );
    }

    #[tokio::test]
    async fn writes_racing_a_delete_leave_nothing_behind() {
        let store = Arc::new(FlakyStore::vanishing());
        let service = service_on(store.clone());
        service.bootstrap().await.unwrap();

        let user = service.create_user(new_user("gone@example.com")).await.unwrap();
        let err = service.resolver().add_direct_permission(user.id, "user:read").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.inner.access_levels_of(Subject::User(user.id)).await.unwrap().is_empty());

        let group = service.create_group("short-lived").await.unwrap();
        let err = service.resolver().add_group_permission(group.id, "user:read").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.inner.access_levels_of(Subject::Group(group.id)).await.unwrap().is_empty());

        let user = service.create_user(new_user("member@example.com")).await.unwrap();
        let group = service.create_group("ops").await.unwrap();
        let err = service.assign_to_group(user.id, group.id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.inner.groups_of_user(user.id).await.unwrap().is_empty());

        let user = service.create_user(new_user("leaver@example.com")).await.unwrap();
        let group = service.create_group("devs").await.unwrap();
        let err = service.set_groups(user.id, &[group.id]).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.inner.users_of_group(group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dummy_hash_is_ready_before_the_first_login() {
        let service = service_on(Arc::new(MemoryStore::new()));
        assert!(service.dummy_hash.get().is_some());
        let err = service.authenticate("nobody@example.com", "password").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
    }
}
