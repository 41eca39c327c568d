use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use super::IdentityStore;
use crate::error::{AppError, Result};
use crate::models::{Access, AccessId, AccessLevel, Group, GroupId, Subject, User, UserId};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    groups: HashMap<GroupId, Group>,
    accesses: HashMap<AccessId, Access>,
    levels: HashMap<(Subject, AccessId), AccessLevel>,
    // (user, group) pairs
    memberships: BTreeSet<(UserId, GroupId)>,
}

impl Tables {
    fn email_taken(&self, email: &str, except: Option<UserId>) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && Some(u.id) != except)
    }

    fn group_name_taken(&self, name: &str, except: Option<GroupId>) -> bool {
        self.groups
            .values()
            .any(|g| g.name == name && Some(g.id) != except)
    }

    fn access_name_taken(&self, name: &str, except: Option<AccessId>) -> bool {
        self.accesses
            .values()
            .any(|a| a.name == name && Some(a.id) != except)
    }

    /// Subject and access must still be present when a level is written.
    fn ensure_level_refs(&self, level: &AccessLevel) -> Result<()> {
        let subject_exists = match level.subject {
            Subject::User(id) => self.users.contains_key(&id),
            Subject::Group(id) => self.groups.contains_key(&id),
        };
        if !subject_exists {
            return Err(AppError::not_found(level.subject));
        }
        if !self.accesses.contains_key(&level.access_id) {
            return Err(AppError::not_found(format!("access {}", level.access_id)));
        }
        Ok(())
    }

    fn ensure_membership_refs(&self, user_id: UserId, group_ids: &[GroupId]) -> Result<()> {
        if !self.users.contains_key(&user_id) {
            return Err(AppError::not_found(format!("user {}", user_id)));
        }
        match group_ids.iter().find(|g| !self.groups.contains_key(g)) {
            Some(missing) => Err(AppError::not_found(format!("group {}", missing))),
            None => Ok(()),
        }
    }

    fn drop_levels_where(&mut self, pred: impl Fn(&AccessLevel) -> bool) {
        self.levels.retain(|_, level| !pred(level));
    }
}

/// Process-local [`IdentityStore`]. Every mutation runs under one write lock,
/// so cascades and membership replacement are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        let mut t = self.tables.write().await;
        if t.email_taken(&user.email, None) {
            return Err(AppError::conflict(format!("user with email {}", user.email)));
        }
        if t.users.contains_key(&user.id) {
            return Err(AppError::conflict(format!("user {}", user.id)));
        }
        t.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut t = self.tables.write().await;
        if !t.users.contains_key(&user.id) {
            return Err(AppError::not_found(format!("user {}", user.id)));
        }
        if t.email_taken(&user.email, Some(user.id)) {
            return Err(AppError::conflict(format!("user with email {}", user.email)));
        }
        t.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete_user(&self, id: UserId) -> Result<bool> {
        let mut t = self.tables.write().await;
        if t.users.remove(&id).is_none() {
            return Ok(false);
        }
        t.drop_levels_where(|l| l.subject == Subject::User(id));
        t.memberships.retain(|(user_id, _)| *user_id != id);
        Ok(true)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_validation_token(&self, token: &str) -> Result<Option<User>> {
        let t = self.tables.read().await;
        Ok(t
            .users
            .values()
            .find(|u| u.email_validation_token.as_deref() == Some(token))
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let t = self.tables.read().await;
        let mut users: Vec<User> = t.users.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.email.cmp(&b.email)));
        Ok(users)
    }

    async fn insert_group(&self, group: &Group) -> Result<()> {
        let mut t = self.tables.write().await;
        if t.group_name_taken(&group.name, None) || t.groups.contains_key(&group.id) {
            return Err(AppError::conflict(format!("group {}", group.name)));
        }
        t.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let mut t = self.tables.write().await;
        if !t.groups.contains_key(&group.id) {
            return Err(AppError::not_found(format!("group {}", group.id)));
        }
        if t.group_name_taken(&group.name, Some(group.id)) {
            return Err(AppError::conflict(format!("group {}", group.name)));
        }
        t.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn delete_group(&self, id: GroupId) -> Result<bool> {
        let mut t = self.tables.write().await;
        if t.groups.remove(&id).is_none() {
            return Ok(false);
        }
        t.drop_levels_where(|l| l.subject == Subject::Group(id));
        t.memberships.retain(|(_, group_id)| *group_id != id);
        Ok(true)
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.tables.read().await.groups.get(&id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let t = self.tables.read().await;
        let mut groups: Vec<Group> = t.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn insert_access(&self, access: &Access) -> Result<()> {
        let mut t = self.tables.write().await;
        if t.access_name_taken(&access.name, None) || t.accesses.contains_key(&access.id) {
            return Err(AppError::conflict(format!("access {}", access.name)));
        }
        t.accesses.insert(access.id, access.clone());
        Ok(())
    }

    async fn update_access(&self, access: &Access) -> Result<()> {
        let mut t = self.tables.write().await;
        if !t.accesses.contains_key(&access.id) {
            return Err(AppError::not_found(format!("access {}", access.id)));
        }
        if t.access_name_taken(&access.name, Some(access.id)) {
            return Err(AppError::conflict(format!("access {}", access.name)));
        }
        t.accesses.insert(access.id, access.clone());
        Ok(())
    }

    async fn delete_access(&self, id: AccessId) -> Result<bool> {
        let mut t = self.tables.write().await;
        if t.accesses.remove(&id).is_none() {
            return Ok(false);
        }
        t.drop_levels_where(|l| l.access_id == id);
        Ok(true)
    }

    async fn get_access(&self, id: AccessId) -> Result<Option<Access>> {
        Ok(self.tables.read().await.accesses.get(&id).cloned())
    }

    async fn find_access_by_name(&self, name: &str) -> Result<Option<Access>> {
        let t = self.tables.read().await;
        Ok(t.accesses.values().find(|a| a.name == name).cloned())
    }

    async fn list_accesses(&self) -> Result<Vec<Access>> {
        let t = self.tables.read().await;
        let mut accesses: Vec<Access> = t.accesses.values().cloned().collect();
        accesses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(accesses)
    }

    async fn count_accesses(&self) -> Result<usize> {
        Ok(self.tables.read().await.accesses.len())
    }

    async fn insert_access_level(&self, level: &AccessLevel) -> Result<()> {
        let mut t = self.tables.write().await;
        let key = (level.subject, level.access_id);
        if t.levels.contains_key(&key) {
            return Err(AppError::conflict(format!(
                "access {} already assigned to {}",
                level.access_id, level.subject
            )));
        }
        t.ensure_level_refs(level)?;
        t.levels.insert(key, level.clone());
        Ok(())
    }

    async fn delete_access_level(&self, subject: Subject, access_id: AccessId) -> Result<bool> {
        let mut t = self.tables.write().await;
        Ok(t.levels.remove(&(subject, access_id)).is_some())
    }

    async fn access_levels_of(&self, subject: Subject) -> Result<Vec<AccessLevel>> {
        let t = self.tables.read().await;
        Ok(t
            .levels
            .values()
            .filter(|l| l.subject == subject)
            .cloned()
            .collect())
    }

    async fn add_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        let mut t = self.tables.write().await;
        t.ensure_membership_refs(user_id, &[group_id])?;
        t.memberships.insert((user_id, group_id));
        Ok(())
    }

    async fn remove_membership(&self, user_id: UserId, group_id: GroupId) -> Result<bool> {
        Ok(self.tables.write().await.memberships.remove(&(user_id, group_id)))
    }

    async fn replace_memberships(&self, user_id: UserId, group_ids: &[GroupId]) -> Result<()> {
        let mut t = self.tables.write().await;
        t.ensure_membership_refs(user_id, group_ids)?;
        t.memberships.retain(|(u, _)| *u != user_id);
        t.memberships
            .extend(group_ids.iter().map(|group_id| (user_id, *group_id)));
        Ok(())
    }

    async fn groups_of_user(&self, user_id: UserId) -> Result<Vec<GroupId>> {
        let t = self.tables.read().await;
        Ok(t
            .memberships
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, group_id)| *group_id)
            .collect())
    }

    async fn users_of_group(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        let t = self.tables.read().await;
        Ok(t
            .memberships
            .iter()
            .filter(|(_, g)| *g == group_id)
            .map(|(user_id, _)| *user_id)
            .collect())
    }
}
