use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

pub type UserId = Uuid;
pub type GroupId = Uuid;
pub type AccessId = Uuid;

/// Lifetime of a regular session, counted from creation or last extension.
pub const SESSION_TTL_HOURS: i64 = 24;
/// Lifetime of a "remember me" session.
pub const LONG_TERM_SESSION_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Admin,
    Employee,
    User,
    Blocked,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Admin => "admin",
            UserType::Employee => "employee",
            UserType::User => "user",
            UserType::Blocked => "blocked",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserType::Admin),
            "employee" => Ok(UserType::Employee),
            "user" => Ok(UserType::User),
            "blocked" => Ok(UserType::Blocked),
            other => Err(AppError::ValidationFailed(format!("unknown user type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub user_type: UserType,
    pub email_validated: bool,
    #[serde(skip_serializing)]
    pub email_validation_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A named permission such as `user:create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub id: AccessId,
    pub name: String,
    pub description: String,
}

/// Who an [`AccessLevel`] is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Subject {
    User(UserId),
    Group(GroupId),
}

impl Subject {
    pub fn id(&self) -> Uuid {
        match self {
            Subject::User(id) | Subject::Group(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Subject::User(_) => "user",
            Subject::Group(_) => "group",
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Result<Self, AppError> {
        match kind {
            "user" => Ok(Subject::User(id)),
            "group" => Ok(Subject::Group(id)),
            other => Err(AppError::Internal(format!("unknown subject kind '{}'", other))),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// Assignment of one [`Access`] to one [`Subject`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLevel {
    pub id: Uuid,
    pub access_id: AccessId,
    pub subject: Subject,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub long_term: bool,
}

impl Session {
    pub fn ttl(long_term: bool) -> Duration {
        if long_term {
            Duration::days(LONG_TERM_SESSION_TTL_DAYS)
        } else {
            Duration::hours(SESSION_TTL_HOURS)
        }
    }

    pub fn new(id: String, user_id: UserId, long_term: bool, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            created_at: now,
            expires_at: now + Self::ttl(long_term),
            long_term,
        }
    }

    /// Single expiry predicate shared by lazy eviction and the sweeper.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.expires_at = now + Self::ttl(self.long_term);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_type_round_trips_through_str() {
        for t in [UserType::Admin, UserType::Employee, UserType::User, UserType::Blocked] {
            assert_eq!(t.as_str().parse::<UserType>().unwrap(), t);
        }
        assert!(matches!("root".parse::<UserType>(), Err(AppError::ValidationFailed(_))));
    }

    #[test]
    fn session_expiry_boundary_is_exclusive() {
        let now = Utc::now();
        let session = Session::new("s".into(), Uuid::new_v4(), false, now);
        assert_eq!(session.expires_at - now, Duration::hours(24));
        assert!(!session.is_expired(session.expires_at));
        assert!(session.is_expired(session.expires_at + Duration::milliseconds(1)));
    }

    #[test]
    fn long_term_session_lasts_thirty_days() {
        let now = Utc::now();
        let session = Session::new("s".into(), Uuid::new_v4(), true, now);
        assert_eq!(session.expires_at - now, Duration::days(30));
    }

    #[test]
    fn subject_serializes_as_tagged_variant() {
        let id = Uuid::nil();
        let json = serde_json::to_value(Subject::Group(id)).unwrap();
        assert_eq!(json["kind"], "group");
        assert_eq!(Subject::from_parts("user", id).unwrap(), Subject::User(id));
        assert!(Subject::from_parts("role", id).is_err());
    }

    #[test]
    fn secrets_are_not_serialized() {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: "a@example.com".into(),
            password_hash: "$argon2id$secret".into(),
            name: "A".into(),
            user_type: UserType::User,
            email_validated: false,
            email_validation_token: Some("tok".into()),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2"));
        assert!(!json.contains("tok\""));
    }
}
