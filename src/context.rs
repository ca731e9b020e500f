/// Reserved principal seeded by the initial migration; carries whatever is
/// granted to unauthenticated subjects.
pub const ANONYMOUS_PRINCIPAL_ID: i32 = 1;

/// Reserved principal seeded by the initial migration; bypasses every check.
pub const UNRESTRICTABLE_PRINCIPAL_ID: i32 = 2;

/// The security identity of one call: which principals are acting, and
/// whether checks are bypassed for trusted internal bookkeeping.
///
/// Always passed explicitly; the engine keeps no ambient per-thread state,
/// so a trust flag can never leak across concurrent logical operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub principals: Vec<i32>,
    pub trusted: bool,
}

impl AuthContext {
    pub fn for_principals(principals: Vec<i32>) -> Self {
        Self {
            principals,
            trusted: false,
        }
    }

    pub fn for_principal(principal: i32) -> Self {
        Self::for_principals(vec![principal])
    }

    pub fn anonymous() -> Self {
        Self::for_principal(ANONYMOUS_PRINCIPAL_ID)
    }

    /// A system context for internal bookkeeping; resolver checks pass
    /// unconditionally. Scope it to the call that needs it.
    pub fn trusted() -> Self {
        Self {
            principals: Vec::new(),
            trusted: true,
        }
    }

    /// The same principal set with checks bypassed; used when a privileged
    /// operation still needs to know who is acting (e.g. default-role grants
    /// at node creation).
    pub fn into_trusted(mut self) -> Self {
        self.trusted = true;
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.trusted || self.principals.contains(&UNRESTRICTABLE_PRINCIPAL_ID)
    }
}
