//! Per-request context: who is calling, and for how long we may work.

use changeflow_protocol::defaults::DEFAULT_REQUEST_TIMEOUT_SECS;
use changeflow_protocol::{ApiError, ApiResult};
use changeflow_security::Principal;
use changeflow_sentinel::CancellationToken;
use std::time::{Duration, Instant};

/// Email used for writes made by background workers.
pub const SYSTEM_BOT_EMAIL: &str = "support@changeflow.local";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
    pub token: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
        }
    }

    /// Context for background work; never times out.
    pub fn system() -> Self {
        Self {
            principal: Principal::new(SYSTEM_BOT_EMAIL),
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn email(&self) -> &str {
        &self.principal.email
    }

    /// Fails once the request is cancelled or past its deadline.
    pub fn check(&self) -> ApiResult<()> {
        if self.token.is_cancelled() {
            return Err(ApiError::cancelled("request cancelled"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ApiError::deadline_exceeded("request deadline exceeded"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_protocol::Code;

    #[test]
    fn test_check_reports_cancel_before_deadline() {
        let ctx = RequestContext::new(Principal::new("bob@x"));
        assert!(ctx.check().is_ok());

        let expired = ctx.clone().with_timeout(Duration::ZERO);
        assert_eq!(expired.check().unwrap_err().code, Code::DeadlineExceeded);

        expired.token.cancel();
        assert_eq!(expired.check().unwrap_err().code, Code::Cancelled);
    }

    #[test]
    fn test_system_context_has_no_deadline() {
        let ctx = RequestContext::system();
        assert!(ctx.deadline.is_none());
        assert_eq!(ctx.email(), SYSTEM_BOT_EMAIL);
    }
}
