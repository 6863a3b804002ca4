use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-secret authentication. Every user presents the server password;
/// the login name becomes the requester identity for reservations.
pub struct BerthAuthSource {
    password: String,
}

impl BerthAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

impl std::fmt::Debug for BerthAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BerthAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for BerthAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
