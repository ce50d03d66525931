use std::collections::HashMap;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Dispatcher,
    Mechanic,
    Viewer,
}

/// What an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    /// Closing a booking once work is done.
    Close,
    /// Creating and amending bookings and bays, cancelling bookings.
    Schedule,
    /// Hard deletes.
    Delete,
    /// Runtime settings such as chat delivery.
    Configure,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Dispatcher => "dispatcher",
            Role::Mechanic => "mechanic",
            Role::Viewer => "viewer",
        }
    }

    pub fn permits(self, permission: Permission) -> bool {
        match self {
            Role::Admin => true,
            Role::Dispatcher => !matches!(permission, Permission::Delete | Permission::Configure),
            Role::Mechanic => matches!(permission, Permission::Read | Permission::Close),
            Role::Viewer => permission == Permission::Read,
        }
    }
}

/// Static token → role table built from configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Role>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, role: Role) {
        self.tokens.insert(token.into(), role);
    }

    pub fn authenticate(&self, token: &str) -> Option<Role> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
