//! Authentication handler interface.
//!
//! Authentication handlers and their caches are a separate concern from the
//! precache core: it never inspects credentials itself. What it does own is
//! the *chain* of configured handlers (`httpd.authentication`) that the
//! HTTP layer consults before a request reaches the precache manager.
//!
//! A narrow, swappable interface around whatever concrete mechanism (PAM,
//! a local shadow file, a token service) validates a request, with the
//! concrete PAM/shadow-file implementations left out since user/password
//! management itself is out of scope here.

use anyhow::{bail, Error};

/// One configured link in the `httpd.authentication` chain.
pub trait AuthenticationHandler: Send + Sync {
    /// Name as it appears in `httpd.authentication` (e.g. `"basic"`, `"token"`).
    fn name(&self) -> &str;

    /// Attempts to authenticate the request's credentials. `Ok(Some(principal))`
    /// on success, `Ok(None)` if this handler does not apply (try the next
    /// one in the chain), `Err` on a hard failure.
    fn authenticate(&self, authorization_header: Option<&str>) -> Result<Option<String>, Error>;
}

/// Handler that accepts every request as an anonymous principal. Used when
/// `httpd.authentication` is empty, and by tests.
pub struct AllowAnonymous;

impl AuthenticationHandler for AllowAnonymous {
    fn name(&self) -> &str {
        "anonymous"
    }

    fn authenticate(&self, _authorization_header: Option<&str>) -> Result<Option<String>, Error> {
        Ok(Some("anonymous".to_string()))
    }
}

/// Runs the configured chain of handlers in order, returning the first
/// principal any handler accepts.
pub struct AuthChain {
    handlers: Vec<Box<dyn AuthenticationHandler>>,
}

impl AuthChain {
    pub fn new(handlers: Vec<Box<dyn AuthenticationHandler>>) -> Self {
        AuthChain { handlers }
    }

    pub fn empty_allows_anonymous() -> Self {
        AuthChain::new(vec![Box::new(AllowAnonymous)])
    }

    /// Returns the authenticated principal, or `Err` (HTTP layer projects
    /// this to `401`) if no handler in the chain accepted the request.
    pub fn authenticate(&self, authorization_header: Option<&str>) -> Result<String, Error> {
        for handler in &self.handlers {
            if let Some(principal) = handler.authenticate(authorization_header)? {
                return Ok(principal);
            }
        }
        bail!("no configured authentication handler accepted this request")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_anonymous_always_succeeds() {
        let chain = AuthChain::empty_allows_anonymous();
        assert_eq!(chain.authenticate(None).unwrap(), "anonymous");
    }

    struct Reject;
    impl AuthenticationHandler for Reject {
        fn name(&self) -> &str {
            "reject"
        }
        fn authenticate(&self, _: Option<&str>) -> Result<Option<String>, Error> {
            Ok(None)
        }
    }

    #[test]
    fn chain_fails_closed_when_nothing_matches() {
        let chain = AuthChain::new(vec![Box::new(Reject)]);
        assert!(chain.authenticate(None).is_err());
    }
}
