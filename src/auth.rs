use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;
use ulid::Ulid;

use crate::directory::Directory;

/// Shared password, plus a directory check: the startup `user` must be a known user id.
pub struct ConciergeAuthSource {
    password: String,
    directory: Arc<dyn Directory>,
}

// Omits the password.
impl std::fmt::Debug for ConciergeAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConciergeAuthSource").finish_non_exhaustive()
    }
}

impl ConciergeAuthSource {
    pub fn new(password: String, directory: Arc<dyn Directory>) -> Self {
        Self {
            password,
            directory,
        }
    }
}

fn unknown_user(detail: String) -> PgWireError {
    metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28000".into(),
        detail,
    )))
}

#[async_trait]
impl AuthSource for ConciergeAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let Some(user) = login.user() else {
            return Err(unknown_user("startup parameter \"user\" is required".into()));
        };
        let known = match Ulid::from_string(user) {
            Ok(id) => self.directory.profile(id).await.is_some(),
            Err(_) => false,
        };
        if !known {
            warn!(user, "login for unknown user");
            return Err(unknown_user(format!("unknown user: {user}")));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
