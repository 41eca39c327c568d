use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Access, Group, User};

#[derive(Debug, Serialize)]
pub struct SetGenericResponse {
    pub success: bool,
    pub error_message: Option<String>,
}

impl SetGenericResponse {
    pub fn ok() -> Self {
        Self { success: true, error_message: None }
    }
}

// --- Auth ---

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub long_term: bool,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub token: Option<String>,
    pub user_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ExtendSessionResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailQuery {
    pub token: String,
}

// --- Users ---

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    /// `admin`, `employee`, `user` or `blocked`; defaults to `user`.
    pub user_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct GetUserResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct SetGroupsRequest {
    pub group_ids: Vec<Uuid>,
}

// --- Permissions ---

#[derive(Debug, Deserialize)]
pub struct PermissionRequest {
    pub permission: String,
}

#[derive(Debug, Serialize)]
pub struct PermissionsResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub permissions: Vec<String>,
}

impl PermissionsResponse {
    pub fn new(permissions: impl IntoIterator<Item = String>) -> Self {
        Self { success: true, error_message: None, permissions: permissions.into_iter().collect() }
    }
}

// --- Groups ---

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateGroupResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct GroupListResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub groups: Vec<Group>,
}

// --- Accesses ---

#[derive(Debug, Deserialize)]
pub struct CreateAccessRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct CreateAccessResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub access_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AccessListResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub accesses: Vec<Access>,
}
