//! Persistence collaborator for users, groups, accesses and their assignments.
//!
//! Implementations enforce the uniqueness constraints themselves and report
//! violations as [`AppError::Conflict`](crate::error::AppError::Conflict):
//! user email, group name, access name, and the (subject, access) pair of an
//! access level. Deleting a user, group or access removes every access level
//! and membership that references it. Writing an access level or a membership
//! whose user, group or access is gone fails with
//! [`AppError::NotFound`](crate::error::AppError::NotFound) and leaves nothing behind.
//! The memory store checks references inside its write lock. The Scylla store
//! re-reads them after writing and undoes the write when one has gone.

pub mod memory;
pub mod scylla_store;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Access, AccessId, AccessLevel, Group, GroupId, Subject, User, UserId};

pub use memory::MemoryStore;
pub use scylla_store::ScyllaStore;

#[async_trait]
pub trait IdentityStore: Send + Sync {
    // Users
    async fn insert_user(&self, user: &User) -> Result<()>;
    /// Fails with `NotFound` for an unknown id and `Conflict` if the new email is taken.
    async fn update_user(&self, user: &User) -> Result<()>;
    /// Returns `false` if no such user existed.
    async fn delete_user(&self, id: UserId) -> Result<bool>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_validation_token(&self, token: &str) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;

    // Groups
    async fn insert_group(&self, group: &Group) -> Result<()>;
    async fn update_group(&self, group: &Group) -> Result<()>;
    async fn delete_group(&self, id: GroupId) -> Result<bool>;
    async fn get_group(&self, id: GroupId) -> Result<Option<Group>>;
    async fn list_groups(&self) -> Result<Vec<Group>>;

    // Accesses
    async fn insert_access(&self, access: &Access) -> Result<()>;
    async fn update_access(&self, access: &Access) -> Result<()>;
    async fn delete_access(&self, id: AccessId) -> Result<bool>;
    async fn get_access(&self, id: AccessId) -> Result<Option<Access>>;
    async fn find_access_by_name(&self, name: &str) -> Result<Option<Access>>;
    async fn list_accesses(&self) -> Result<Vec<Access>>;
    async fn count_accesses(&self) -> Result<usize>;

    // Access levels
    async fn insert_access_level(&self, level: &AccessLevel) -> Result<()>;
    /// Returns `false` if the subject did not hold the access.
    async fn delete_access_level(&self, subject: Subject, access_id: AccessId) -> Result<bool>;
    async fn access_levels_of(&self, subject: Subject) -> Result<Vec<AccessLevel>>;

    // Group membership
    /// Idempotent: adding an existing membership succeeds.
    async fn add_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()>;
    async fn remove_membership(&self, user_id: UserId, group_id: GroupId) -> Result<bool>;
    /// Replaces the user's memberships in one step. On `NotFound` the old set stays.
    async fn replace_memberships(&self, user_id: UserId, group_ids: &[GroupId]) -> Result<()>;
    async fn groups_of_user(&self, user_id: UserId) -> Result<Vec<GroupId>>;
    async fn users_of_group(&self, group_id: GroupId) -> Result<Vec<UserId>>;
}
