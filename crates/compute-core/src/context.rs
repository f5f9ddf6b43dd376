use serde::{Deserialize, Serialize};

pub const ADMIN_ROLE: &str = "admin";

/// Authenticated caller bound to every service call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub user_id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CallerContext {
    pub fn new(user_id: u64, username: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            roles,
        }
    }

    pub fn user(user_id: u64) -> Self {
        Self::new(user_id, String::new(), vec!["user".to_string()])
    }

    pub fn admin(user_id: u64) -> Self {
        Self::new(user_id, "admin", vec![ADMIN_ROLE.to_string()])
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    /// Admins see everything; everyone else only what they own.
    pub fn can_access(&self, owner: u64) -> bool {
        self.is_admin() || owner == self.user_id
    }

    /// Name recorded on events.
    pub fn actor(&self) -> String {
        if self.username.is_empty() {
            self.user_id.to_string()
        } else {
            self.username.clone()
        }
    }
}
