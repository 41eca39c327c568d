use std::sync::Arc;

use crate::error::Result;
use crate::models::{Session, User, UserId, UserType};
use crate::resolver::PermissionResolver;
use crate::service::{AccessService, UserUpdate};
use crate::session::SessionStore;

/// Shared application state handed to every request handler.
#[derive(Clone)]
pub struct StateManager {
    pub service: AccessService,
    pub sessions: Arc<SessionStore>,
}

impl StateManager {
    pub fn new(service: AccessService, sessions: Arc<SessionStore>) -> Self {
        Self { service, sessions }
    }

    pub fn resolver(&self) -> &PermissionResolver {
        self.service.resolver()
    }

    /// Authenticates and opens a session.
    pub async fn login(&self, email: &str, password: &str, long_term: bool) -> Result<(User, Session)> {
        let user = self.service.authenticate(email, password).await?;
        let session_id = self.sessions.create_session(user.id, long_term);
        let session = self.sessions.get_session(&session_id)?;
        tracing::info!("User {} logged in (long_term={})", user.id, long_term);
        Ok((user, session))
    }

    pub fn logout(&self, session_id: &str) {
        self.sessions.delete_session(session_id);
    }

    /// Changes the password and ends every session of the user, including the caller's.
    pub async fn change_password(&self, user_id: UserId, current: &str, new: &str) -> Result<()> {
        self.service.change_password(user_id, current, new).await?;
        self.sessions.revoke_user_sessions(user_id);
        Ok(())
    }

    /// Blocking a user also ends its sessions.
    pub async fn update_user(&self, user_id: UserId, update: UserUpdate) -> Result<User> {
        let user = self.service.update_user(user_id, update).await?;
        if user.user_type == UserType::Blocked {
            self.sessions.revoke_user_sessions(user_id);
        }
        Ok(user)
    }

    pub async fn delete_user(&self, user_id: UserId) -> Result<()> {
        self.service.delete_user(user_id).await?;
        self.sessions.revoke_user_sessions(user_id);
        Ok(())
    }
}
