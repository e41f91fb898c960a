use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role granted by the upstream identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A photographer managing their own catalog.
    Photographer,
    /// Marketplace administrator with access to every catalog.
    Admin,
}

impl Role {
    /// Parse the role header value. Anything that is not `admin` is treated
    /// as a regular photographer.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::Photographer
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Identity triple attached to an authenticated request.
///
/// The upstream auth proxy validates credentials and forwards this triple;
/// the pipeline trusts it and never re-checks credentials.
#[derive(Debug, Clone)]
pub struct CallerContext {
    /// Stable owner identifier.
    pub user_id: Uuid,
    /// Namespace-safe owner label used to partition storage paths.
    pub slug: String,
    pub role: Role,
}

impl CallerContext {
    /// Whether this caller may access artifacts owned by `owner_id`.
    pub fn can_access(&self, owner_id: Uuid) -> bool {
        self.role.is_admin() || self.user_id == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse(" admin "), Role::Admin);
        assert_eq!(Role::parse("photographer"), Role::Photographer);
        assert_eq!(Role::parse(""), Role::Photographer);
    }

    #[test]
    fn test_can_access() {
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();

        let caller = CallerContext {
            user_id: owner,
            slug: "jorge".to_string(),
            role: Role::Photographer,
        };
        assert!(caller.can_access(owner));
        assert!(!caller.can_access(other));

        let admin = CallerContext {
            user_id: other,
            slug: "admin".to_string(),
            role: Role::Admin,
        };
        assert!(admin.can_access(owner));
    }
}
