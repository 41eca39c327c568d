use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session as ScyllaSession;
use scylla::client::session_builder::SessionBuilder;
use scylla::serialize::row::SerializeRow;
use scylla::statement::batch::{Batch, BatchType};
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use uuid::Uuid;

use super::IdentityStore;
use crate::error::{AppError, Result};
use crate::models::{Access, AccessId, AccessLevel, Group, GroupId, Subject, User, UserId};

type UserRow = (
    Uuid,
    String,
    String,
    String,
    String,
    bool,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const USER_COLUMNS: &str = "user_id, email, password_hash, name, user_type, email_validated, \
     email_validation_token, created_ts, updated_ts";

fn user_from_row(row: UserRow) -> Result<User> {
    let (id, email, password_hash, name, user_type, email_validated, token, created_at, updated_at) = row;
    Ok(User {
        id,
        email,
        password_hash,
        name,
        user_type: user_type
            .parse()
            .map_err(|_| AppError::Internal(format!("Invalid user_type '{}' for user {}", user_type, id)))?,
        email_validated,
        email_validation_token: token.filter(|t| !t.is_empty()),
        created_at,
        updated_at,
    })
}

/// Logged batch whose statements may carry differently shaped values.
struct BatchBuilder {
    batch: Batch,
    values: Vec<Vec<CqlValue>>,
}

impl BatchBuilder {
    fn new() -> Self {
        Self { batch: Batch::new(BatchType::Logged), values: Vec::new() }
    }

    fn push(&mut self, cql: String, values: Vec<CqlValue>) {
        self.batch.append_statement(cql.as_str());
        self.values.push(values);
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// [`IdentityStore`] on ScyllaDB. Uniqueness is enforced with lookup tables
/// written through lightweight transactions (`IF NOT EXISTS`); multi-table
/// deletes and membership replacement go through logged batches.
#[derive(Clone)]
pub struct ScyllaStore {
    session: Arc<ScyllaSession>,
    keyspace: String,
}

impl ScyllaStore {
    pub async fn connect(nodes: &[String], credentials: Option<(String, String)>, keyspace: &str) -> Result<Self> {
        let mut builder = SessionBuilder::new().known_nodes(nodes);
        if let Some((user, password)) = credentials {
            builder = builder.user(user, password);
        }
        let session = builder.build().await?;
        tracing::info!("Connected to Scylla nodes {:?}", nodes);
        Ok(Self::from_session(Arc::new(session), keyspace))
    }

    pub fn from_session(session: Arc<ScyllaSession>, keyspace: &str) -> Self {
        Self { session, keyspace: keyspace.to_string() }
    }

    pub fn session(&self) -> &ScyllaSession {
        &self.session
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.keyspace, name)
    }

    async fn execute(&self, cql: String, values: impl SerializeRow) -> Result<()> {
        self.session.query_unpaged(cql, values).await?;
        Ok(())
    }

    async fn run_batch(&self, batch: BatchBuilder) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.session.batch(&batch.batch, batch.values).await?;
        Ok(())
    }

    /// Runs a conditional statement and reports whether it was applied.
    async fn conditional(&self, cql: String, values: impl SerializeRow) -> Result<bool> {
        let rows = self.session.query_unpaged(cql, values).await?.into_rows_result()?;
        let first: Option<Row> = rows.rows::<Row>()?.next().transpose()?;
        Ok(first
            .and_then(|row| row.columns.into_iter().next().flatten())
            .and_then(|applied| applied.as_boolean())
            .unwrap_or(false))
    }

    async fn select_users(&self, cql: String, values: impl SerializeRow) -> Result<Vec<User>> {
        let rows = self.session.query_unpaged(cql, values).await?.into_rows_result()?;
        let mut users = Vec::new();
        for row in rows.rows::<UserRow>()? {
            users.push(user_from_row(row?)?);
        }
        Ok(users)
    }

    async fn lookup_id(&self, cql: String, key: &str) -> Result<Option<Uuid>> {
        let rows = self.session.query_unpaged(cql, (key,)).await?.into_rows_result()?;
        let id = rows.rows::<(Uuid,)>()?.next().transpose()?;
        Ok(id.map(|(id,)| id))
    }

    async fn user_by_lookup(&self, lookup_table: &str, key_column: &str, key: &str) -> Result<Option<User>> {
        let cql = format!("SELECT user_id FROM {} WHERE {} = ?", self.table(lookup_table), key_column);
        match self.lookup_id(cql, key).await? {
            Some(user_id) => self.get_user(user_id).await,
            None => Ok(None),
        }
    }

    async fn claim(&self, lookup_table: &str, key_column: &str, id_column: &str, key: &str, id: Uuid) -> Result<bool> {
        let cql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?) IF NOT EXISTS",
            self.table(lookup_table),
            key_column,
            id_column
        );
        self.conditional(cql, (key, id)).await
    }

    async fn release(&self, lookup_table: &str, key_column: &str, key: &str) -> Result<()> {
        let cql = format!("DELETE FROM {} WHERE {} = ?", self.table(lookup_table), key_column);
        self.execute(cql, (key,)).await
    }

    async fn write_user_row(&self, user: &User) -> Result<()> {
        let cql = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table("users"),
            USER_COLUMNS
        );
        self.execute(
            cql,
            (
                user.id,
                &user.email,
                &user.password_hash,
                &user.name,
                user.user_type.as_str(),
                user.email_validated,
                user.email_validation_token.as_deref().unwrap_or_default(),
                user.created_at,
                user.updated_at,
            ),
        )
        .await
    }

    async fn select_access(&self, cql: String, values: impl SerializeRow) -> Result<Vec<Access>> {
        let rows = self.session.query_unpaged(cql, values).await?.into_rows_result()?;
        let mut accesses = Vec::new();
        for row in rows.rows::<(Uuid, String, Option<String>)>()? {
            let (id, name, description) = row?;
            accesses.push(Access { id, name, description: description.unwrap_or_default() });
        }
        Ok(accesses)
    }

    async fn select_groups(&self, cql: String, values: impl SerializeRow) -> Result<Vec<Group>> {
        let rows = self.session.query_unpaged(cql, values).await?.into_rows_result()?;
        let mut groups = Vec::new();
        for row in rows.rows::<(Uuid, String, DateTime<Utc>)>()? {
            let (id, name, created_at) = row?;
            groups.push(Group { id, name, created_at });
        }
        Ok(groups)
    }

    async fn select_ids(&self, cql: String, key: Uuid) -> Result<Vec<Uuid>> {
        let rows = self.session.query_unpaged(cql, (key,)).await?.into_rows_result()?;
        let mut ids = Vec::new();
        for row in rows.rows::<(Uuid,)>()? {
            ids.push(row?.0);
        }
        Ok(ids)
    }

    /// Queues deletion of every access level held by `subject`, in both index tables.
    async fn queue_subject_levels_delete(&self, batch: &mut BatchBuilder, subject: Subject) -> Result<()> {
        for level in self.access_levels_of(subject).await? {
            batch.push(
                format!(
                    "DELETE FROM {} WHERE access_id = ? AND subject_kind = ? AND subject_id = ?",
                    self.table("access_level_by_access")
                ),
                vec![
                    CqlValue::Uuid(level.access_id),
                    CqlValue::Text(subject.kind().to_string()),
                    CqlValue::Uuid(subject.id()),
                ],
            );
        }
        batch.push(
            format!("DELETE FROM {} WHERE subject_kind = ? AND subject_id = ?", self.table("access_level")),
            vec![CqlValue::Text(subject.kind().to_string()), CqlValue::Uuid(subject.id())],
        );
        Ok(())
    }

    // Deletes can land between a caller's existence check and a level or membership
    // write, and there is no cross-partition transaction to close that gap. Writes
    // re-read their references afterwards and undo themselves when one is gone. A
    // delete that lands after the re-read can still leave a dangling row.
    async fn missing_subject(&self, subject: Subject) -> Result<Option<String>> {
        let found = match subject {
            Subject::User(id) => self.get_user(id).await?.is_some(),
            Subject::Group(id) => self.get_group(id).await?.is_some(),
        };
        Ok((!found).then(|| subject.to_string()))
    }

    async fn missing_level_ref(&self, level: &AccessLevel) -> Result<Option<String>> {
        if let Some(missing) = self.missing_subject(level.subject).await? {
            return Ok(Some(missing));
        }
        if self.get_access(level.access_id).await?.is_none() {
            return Ok(Some(format!("access {}", level.access_id)));
        }
        Ok(None)
    }

    async fn missing_group(&self, group_ids: &[GroupId]) -> Result<Option<String>> {
        for group_id in group_ids {
            if self.get_group(*group_id).await?.is_none() {
                return Ok(Some(format!("group {}", group_id)));
            }
        }
        Ok(None)
    }

    fn queue_membership(&self, batch: &mut BatchBuilder, user_id: UserId, group_id: GroupId, insert: bool) {
        let values = |first: Uuid, second: Uuid| vec![CqlValue::Uuid(first), CqlValue::Uuid(second)];
        if insert {
            batch.push(
                format!("INSERT INTO {} (user_id, group_id) VALUES (?, ?)", self.table("user_membership")),
                values(user_id, group_id),
            );
            batch.push(
                format!("INSERT INTO {} (group_id, user_id) VALUES (?, ?)", self.table("group_membership")),
                values(group_id, user_id),
            );
        } else {
            batch.push(
                format!("DELETE FROM {} WHERE user_id = ? AND group_id = ?", self.table("user_membership")),
                values(user_id, group_id),
            );
            batch.push(
                format!("DELETE FROM {} WHERE group_id = ? AND user_id = ?", self.table("group_membership")),
                values(group_id, user_id),
            );
        }
    }
}

#[async_trait]
impl IdentityStore for ScyllaStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        if !self.claim("user_by_email", "email", "user_id", &user.email, user.id).await? {
            return Err(AppError::conflict(format!("user with email {}", user.email)));
        }
        if let Err(e) = self.write_user_row(user).await {
            // Give the email back so a retry is possible.
            self.release("user_by_email", "email", &user.email).await?;
            return Err(e);
        }
        if let Some(token) = &user.email_validation_token {
            let cql = format!("INSERT INTO {} (token, user_id) VALUES (?, ?)", self.table("user_by_validation_token"));
            self.execute(cql, (token, user.id)).await?;
        }
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let current = self
            .get_user(user.id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("user {}", user.id)))?;

        if current.email != user.email {
            if !self.claim("user_by_email", "email", "user_id", &user.email, user.id).await? {
                return Err(AppError::conflict(format!("user with email {}", user.email)));
            }
            self.release("user_by_email", "email", &current.email).await?;
        }
        if current.email_validation_token != user.email_validation_token {
            if let Some(old) = &current.email_validation_token {
                self.release("user_by_validation_token", "token", old).await?;
            }
            if let Some(new) = &user.email_validation_token {
                let cql = format!("INSERT INTO {} (token, user_id) VALUES (?, ?)", self.table("user_by_validation_token"));
                self.execute(cql, (new, user.id)).await?;
            }
        }
        self.write_user_row(user).await
    }

    async fn delete_user(&self, id: UserId) -> Result<bool> {
        let Some(user) = self.get_user(id).await? else {
            return Ok(false);
        };
        let mut batch = BatchBuilder::new();
        batch.push(format!("DELETE FROM {} WHERE user_id = ?", self.table("users")), vec![CqlValue::Uuid(id)]);
        batch.push(
            format!("DELETE FROM {} WHERE email = ?", self.table("user_by_email")),
            vec![CqlValue::Text(user.email.clone())],
        );
        if let Some(token) = user.email_validation_token {
            batch.push(
                format!("DELETE FROM {} WHERE token = ?", self.table("user_by_validation_token")),
                vec![CqlValue::Text(token)],
            );
        }
        self.queue_subject_levels_delete(&mut batch, Subject::User(id)).await?;
        for group_id in self.groups_of_user(id).await? {
            self.queue_membership(&mut batch, id, group_id, false);
        }
        self.run_batch(batch).await?;
        Ok(true)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let cql = format!("SELECT {} FROM {} WHERE user_id = ?", USER_COLUMNS, self.table("users"));
        Ok(self.select_users(cql, (id,)).await?.into_iter().next())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.user_by_lookup("user_by_email", "email", email).await
    }

    async fn find_user_by_validation_token(&self, token: &str) -> Result<Option<User>> {
        self.user_by_lookup("user_by_validation_token", "token", token).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let cql = format!("SELECT {} FROM {}", USER_COLUMNS, self.table("users"));
        let mut users = self.select_users(cql, ()).await?;
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.email.cmp(&b.email)));
        Ok(users)
    }

    async fn insert_group(&self, group: &Group) -> Result<()> {
        if !self.claim("group_by_name", "name", "group_id", &group.name, group.id).await? {
            return Err(AppError::conflict(format!("group {}", group.name)));
        }
        let cql = format!("INSERT INTO {} (group_id, name, created_ts) VALUES (?, ?, ?)", self.table("access_group"));
        if let Err(e) = self.execute(cql, (group.id, &group.name, group.created_at)).await {
            self.release("group_by_name", "name", &group.name).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let current = self
            .get_group(group.id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("group {}", group.id)))?;
        if current.name != group.name {
            if !self.claim("group_by_name", "name", "group_id", &group.name, group.id).await? {
                return Err(AppError::conflict(format!("group {}", group.name)));
            }
            self.release("group_by_name", "name", &current.name).await?;
        }
        let cql = format!("UPDATE {} SET name = ? WHERE group_id = ?", self.table("access_group"));
        self.execute(cql, (&group.name, group.id)).await
    }

    async fn delete_group(&self, id: GroupId) -> Result<bool> {
        let Some(group) = self.get_group(id).await? else {
            return Ok(false);
        };
        let mut batch = BatchBuilder::new();
        batch.push(format!("DELETE FROM {} WHERE group_id = ?", self.table("access_group")), vec![CqlValue::Uuid(id)]);
        batch.push(
            format!("DELETE FROM {} WHERE name = ?", self.table("group_by_name")),
            vec![CqlValue::Text(group.name)],
        );
        self.queue_subject_levels_delete(&mut batch, Subject::Group(id)).await?;
        for user_id in self.users_of_group(id).await? {
            self.queue_membership(&mut batch, user_id, id, false);
        }
        self.run_batch(batch).await?;
        Ok(true)
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<Group>> {
        let cql = format!("SELECT group_id, name, created_ts FROM {} WHERE group_id = ?", self.table("access_group"));
        Ok(self.select_groups(cql, (id,)).await?.into_iter().next())
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        let cql = format!("SELECT group_id, name, created_ts FROM {}", self.table("access_group"));
        let mut groups = self.select_groups(cql, ()).await?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn insert_access(&self, access: &Access) -> Result<()> {
        if !self.claim("access_by_name", "name", "access_id", &access.name, access.id).await? {
            return Err(AppError::conflict(format!("access {}", access.name)));
        }
        let cql = format!("INSERT INTO {} (access_id, name, description) VALUES (?, ?, ?)", self.table("access_right"));
        if let Err(e) = self.execute(cql, (access.id, &access.name, &access.description)).await {
            self.release("access_by_name", "name", &access.name).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn update_access(&self, access: &Access) -> Result<()> {
        let current = self
            .get_access(access.id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("access {}", access.id)))?;
        if current.name != access.name {
            if !self.claim("access_by_name", "name", "access_id", &access.name, access.id).await? {
                return Err(AppError::conflict(format!("access {}", access.name)));
            }
            self.release("access_by_name", "name", &current.name).await?;
        }
        let cql = format!("UPDATE {} SET name = ?, description = ? WHERE access_id = ?", self.table("access_right"));
        self.execute(cql, (&access.name, &access.description, access.id)).await
    }

    async fn delete_access(&self, id: AccessId) -> Result<bool> {
        let Some(access) = self.get_access(id).await? else {
            return Ok(false);
        };
        let holders = {
            let cql = format!(
                "SELECT subject_kind, subject_id FROM {} WHERE access_id = ?",
                self.table("access_level_by_access")
            );
            let rows = self.session.query_unpaged(cql, (id,)).await?.into_rows_result()?;
            let mut holders = Vec::new();
            for row in rows.rows::<(String, Uuid)>()? {
                let (kind, subject_id) = row?;
                holders.push(Subject::from_parts(&kind, subject_id)?);
            }
            holders
        };

        let mut batch = BatchBuilder::new();
        for subject in holders {
            batch.push(
                format!(
                    "DELETE FROM {} WHERE subject_kind = ? AND subject_id = ? AND access_id = ?",
                    self.table("access_level")
                ),
                vec![
                    CqlValue::Text(subject.kind().to_string()),
                    CqlValue::Uuid(subject.id()),
                    CqlValue::Uuid(id),
                ],
            );
        }
        batch.push(
            format!("DELETE FROM {} WHERE access_id = ?", self.table("access_level_by_access")),
            vec![CqlValue::Uuid(id)],
        );
        batch.push(format!("DELETE FROM {} WHERE access_id = ?", self.table("access_right")), vec![CqlValue::Uuid(id)]);
        batch.push(
            format!("DELETE FROM {} WHERE name = ?", self.table("access_by_name")),
            vec![CqlValue::Text(access.name)],
        );
        self.run_batch(batch).await?;
        Ok(true)
    }

    async fn get_access(&self, id: AccessId) -> Result<Option<Access>> {
        let cql = format!("SELECT access_id, name, description FROM {} WHERE access_id = ?", self.table("access_right"));
        Ok(self.select_access(cql, (id,)).await?.into_iter().next())
    }

    async fn find_access_by_name(&self, name: &str) -> Result<Option<Access>> {
        let cql = format!("SELECT access_id FROM {} WHERE name = ?", self.table("access_by_name"));
        match self.lookup_id(cql, name).await? {
            Some(id) => self.get_access(id).await,
            None => Ok(None),
        }
    }

    async fn list_accesses(&self) -> Result<Vec<Access>> {
        let cql = format!("SELECT access_id, name, description FROM {}", self.table("access_right"));
        let mut accesses = self.select_access(cql, ()).await?;
        accesses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(accesses)
    }

    async fn count_accesses(&self) -> Result<usize> {
        let cql = format!("SELECT COUNT(*) FROM {}", self.table("access_right"));
        let rows = self.session.query_unpaged(cql, ()).await?.into_rows_result()?;
        let count = rows.rows::<(i64,)>()?.next().transpose()?.map(|(c,)| c).unwrap_or(0);
        Ok(count.max(0) as usize)
    }

    async fn insert_access_level(&self, level: &AccessLevel) -> Result<()> {
        let cql = format!(
            "INSERT INTO {} (subject_kind, subject_id, access_id, level_id, created_ts) VALUES (?, ?, ?, ?, ?) IF NOT EXISTS",
            self.table("access_level")
        );
        let applied = self
            .conditional(
                cql,
                (level.subject.kind(), level.subject.id(), level.access_id, level.id, level.created_at),
            )
            .await?;
        if !applied {
            return Err(AppError::conflict(format!(
                "access {} already assigned to {}",
                level.access_id, level.subject
            )));
        }
        let cql = format!(
            "INSERT INTO {} (access_id, subject_kind, subject_id) VALUES (?, ?, ?)",
            self.table("access_level_by_access")
        );
        self.execute(cql, (level.access_id, level.subject.kind(), level.subject.id())).await?;

        if let Some(missing) = self.missing_level_ref(level).await? {
            tracing::warn!("Undoing level {}: {} was deleted concurrently", level.id, missing);
            self.delete_access_level(level.subject, level.access_id).await?;
            return Err(AppError::not_found(missing));
        }
        Ok(())
    }

    async fn delete_access_level(&self, subject: Subject, access_id: AccessId) -> Result<bool> {
        let cql = format!(
            "DELETE FROM {} WHERE subject_kind = ? AND subject_id = ? AND access_id = ? IF EXISTS",
            self.table("access_level")
        );
        let removed = self.conditional(cql, (subject.kind(), subject.id(), access_id)).await?;
        if removed {
            let cql = format!(
                "DELETE FROM {} WHERE access_id = ? AND subject_kind = ? AND subject_id = ?",
                self.table("access_level_by_access")
            );
            self.execute(cql, (access_id, subject.kind(), subject.id())).await?;
        }
        Ok(removed)
    }

    async fn access_levels_of(&self, subject: Subject) -> Result<Vec<AccessLevel>> {
        let cql = format!(
            "SELECT access_id, level_id, created_ts FROM {} WHERE subject_kind = ? AND subject_id = ?",
            self.table("access_level")
        );
        let rows = self
            .session
            .query_unpaged(cql, (subject.kind(), subject.id()))
            .await?
            .into_rows_result()?;
        let mut levels = Vec::new();
        for row in rows.rows::<(Uuid, Uuid, DateTime<Utc>)>()? {
            let (access_id, id, created_at) = row?;
            levels.push(AccessLevel { id, access_id, subject, created_at });
        }
        Ok(levels)
    }

    async fn add_membership(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        let mut batch = BatchBuilder::new();
        self.queue_membership(&mut batch, user_id, group_id, true);
        self.run_batch(batch).await?;

        let missing = match self.missing_subject(Subject::User(user_id)).await? {
            Some(missing) => Some(missing),
            None => self.missing_group(&[group_id]).await?,
        };
        if let Some(missing) = missing {
            tracing::warn!("Undoing membership {} in {}: {} was deleted concurrently", user_id, group_id, missing);
            let mut undo = BatchBuilder::new();
            self.queue_membership(&mut undo, user_id, group_id, false);
            self.run_batch(undo).await?;
            return Err(AppError::not_found(missing));
        }
        Ok(())
    }

    async fn remove_membership(&self, user_id: UserId, group_id: GroupId) -> Result<bool> {
        let existed = self.groups_of_user(user_id).await?.contains(&group_id);
        if existed {
            let mut batch = BatchBuilder::new();
            self.queue_membership(&mut batch, user_id, group_id, false);
            self.run_batch(batch).await?;
        }
        Ok(existed)
    }

    async fn replace_memberships(&self, user_id: UserId, group_ids: &[GroupId]) -> Result<()> {
        let current = self.groups_of_user(user_id).await?;
        let mut batch = BatchBuilder::new();
        for group_id in current.iter().filter(|g| !group_ids.contains(g)) {
            self.queue_membership(&mut batch, user_id, *group_id, false);
        }
        for group_id in group_ids.iter().filter(|g| !current.contains(g)) {
            self.queue_membership(&mut batch, user_id, *group_id, true);
        }
        self.run_batch(batch).await?;

        if let Some(missing) = self.missing_subject(Subject::User(user_id)).await? {
            // The user's cascade may have run before our batch; clear every pair we touched.
            tracing::warn!("Clearing memberships of {}: user was deleted concurrently", user_id);
            let mut undo = BatchBuilder::new();
            for group_id in current.iter().chain(group_ids.iter().filter(|g| !current.contains(g))) {
                self.queue_membership(&mut undo, user_id, *group_id, false);
            }
            self.run_batch(undo).await?;
            return Err(AppError::not_found(missing));
        }
        if let Some(missing) = self.missing_group(group_ids).await? {
            tracing::warn!("Restoring memberships of {}: {} was deleted concurrently", user_id, missing);
            let mut undo = BatchBuilder::new();
            for group_id in group_ids.iter().filter(|g| !current.contains(g)) {
                self.queue_membership(&mut undo, user_id, *group_id, false);
            }
            for group_id in current.iter().filter(|g| !group_ids.contains(g)) {
                self.queue_membership(&mut undo, user_id, *group_id, true);
            }
            self.run_batch(undo).await?;
            return Err(AppError::not_found(missing));
        }
        Ok(())
    }

    async fn groups_of_user(&self, user_id: UserId) -> Result<Vec<GroupId>> {
        let cql = format!("SELECT group_id FROM {} WHERE user_id = ?", self.table("user_membership"));
        self.select_ids(cql, user_id).await
    }

    async fn users_of_group(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        let cql = format!("SELECT user_id FROM {} WHERE group_id = ?", self.table("group_membership"));
        self.select_ids(cql, group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserType;

    #[test]
    fn parses_user_rows() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let user = user_from_row((
            id,
            "a@example.com".into(),
            "hash".into(),
            "A".into(),
            "employee".into(),
            false,
            Some(String::new()),
            now,
            now,
        ))
        .unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.user_type, UserType::Employee);
        // Empty text column means "no token".
        assert_eq!(user.email_validation_token, None);
    }

    #[test]
    fn rejects_unknown_user_type_in_row() {
        let now = Utc::now();
        let row = (Uuid::new_v4(), "a".into(), "h".into(), "n".into(), "root".into(), true, None, now, now);
        assert!(matches!(user_from_row(row), Err(AppError::Internal(_))));
    }

    #[test]
    fn batch_builder_tracks_statements() {
        let mut batch = BatchBuilder::new();
        assert!(batch.is_empty());
        batch.push("DELETE FROM ks.users WHERE user_id = ?".into(), vec![CqlValue::Uuid(Uuid::nil())]);
        assert!(!batch.is_empty());
        assert_eq!(batch.values.len(), 1);
    }

    // Needs a Scylla node on 127.0.0.1:9042 with the schema migrated.
    #[tokio::test]
    #[ignore]
    async fn round_trips_against_live_node() {
        let store = ScyllaStore::connect(&["127.0.0.1:9042".to_string()], None, "warden").await.unwrap();
        let access = Access { id: Uuid::new_v4(), name: format!("test:{}", Uuid::new_v4()), description: String::new() };
        store.insert_access(&access).await.unwrap();
        assert!(store.insert_access(&access).await.unwrap_err().is_conflict());
        assert_eq!(store.find_access_by_name(&access.name).await.unwrap(), Some(access.clone()));
        assert!(store.delete_access(access.id).await.unwrap());
    }
}
