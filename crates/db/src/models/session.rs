use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserRole {
    Worker,
    Subcontractor,
    Foreman,
    ProjectManager,
    Admin,
}

impl UserRole {
    /// Restricted roles only see tasks they are assigned to or created.
    pub fn is_restricted(self) -> bool {
        matches!(self, UserRole::Worker | UserRole::Subcontractor)
    }
}

/// Caller identity handed to the task store by the session/profile provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub user_id: Uuid,
    pub role: UserRole,
    pub trade_specialty: Option<String>,
}

impl SessionContext {
    pub fn new(user_id: Uuid, role: UserRole) -> Self {
        Self {
            user_id,
            role,
            trade_specialty: None,
        }
    }

    pub fn with_trade(mut self, trade: impl Into<String>) -> Self {
        self.trade_specialty = Some(trade.into());
        self
    }
}
