use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::observability;

/// Single shared credential. The password check itself happens in pgwire's
/// cleartext startup handler; we only refuse unknown users up front.
#[derive(Debug)]
pub struct SeatlineAuthSource {
    user: String,
    password: String,
}

impl SeatlineAuthSource {
    pub fn new(user: String, password: String) -> Self {
        Self { user, password }
    }
}

#[async_trait]
impl AuthSource for SeatlineAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if user != self.user {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!(user, "login refused: unknown user");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28P01".into(),
                format!("password authentication failed for user \"{user}\""),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
