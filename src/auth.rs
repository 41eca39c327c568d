use actix_web::{
    dev::Payload, error::ErrorForbidden, error::ErrorUnauthorized, http::header::AUTHORIZATION, FromRequest,
    HttpRequest,
};
use chrono::{DateTime, Utc};
use futures_util::future::{ready, Ready};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::StateManager;

pub const SESSION_COOKIE: &str = "session";

// Extractor for authenticated users
pub struct LoggedUser {
    pub user_id: Uuid,
    pub session_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

impl FromRequest for LoggedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        // Only the token is read here; validate() checks it against the session store.
        let token = req
            .cookie(SESSION_COOKIE)
            .map(|c| c.value().to_owned())
            .filter(|v| !v.is_empty())
            .or_else(|| bearer_token(req));

        match token {
            Some(session_token) => ready(Ok(LoggedUser { user_id: Uuid::nil(), session_token, expires_at: None })),
            None => {
                tracing::debug!("Session cookie and bearer token missing.");
                ready(Err(ErrorUnauthorized("Authentication credentials missing")))
            }
        }
    }
}

impl LoggedUser {
    /// Resolves the session. Missing or expired sessions are a 401.
    pub async fn validate(&mut self, state: &Arc<StateManager>) -> Result<Uuid, actix_web::Error> {
        match state.sessions.get_session(&self.session_token) {
            Ok(session) => {
                self.user_id = session.user_id;
                self.expires_at = Some(session.expires_at);
                Ok(session.user_id)
            }
            Err(AppError::Expired) => {
                tracing::debug!("Expired session presented");
                Err(ErrorUnauthorized("Session expired"))
            }
            Err(_) => Err(ErrorUnauthorized("Invalid or expired session")),
        }
    }

    /// Validates the session and checks that its user holds `permission` (403 otherwise).
    pub async fn require(&mut self, state: &Arc<StateManager>, permission: &str) -> Result<Uuid, actix_web::Error> {
        let user_id = self.validate(state).await?;
        match state.resolver().has_permission(user_id, permission).await {
            Ok(true) => Ok(user_id),
            Ok(false) => {
                tracing::warn!("User {} lacks permission {}", user_id, permission);
                Err(ErrorForbidden(format!("Missing permission {}", permission)))
            }
            // The session outlived its user.
            Err(e) if e.is_not_found() => Err(ErrorUnauthorized("Invalid or expired session")),
            Err(e) => Err(e.into()),
        }
    }
}
