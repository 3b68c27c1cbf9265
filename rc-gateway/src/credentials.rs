use std::{collections::HashMap, fmt, fs, io, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "operario")]
    Operator,
    Admin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Operator => f.write_str("operator"),
            Role::Admin => f.write_str("admin"),
        }
    }
}

/// Answers whether a user/secret pair is valid and which role it carries.
pub trait CredentialStore: Send + Sync {
    fn validate(&self, user: &str, secret: &str) -> Option<Role>;
}

pub type SharedCredentials = Arc<dyn CredentialStore>;

#[derive(Debug)]
pub enum CredentialError {
    Read(io::Error),
    Decode(serde_json::Error),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::Read(err) => write!(f, "failed to read credential file: {err}"),
            CredentialError::Decode(err) => write!(f, "invalid credential file: {err}"),
        }
    }
}

impl std::error::Error for CredentialError {}

#[derive(Clone, Debug, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub secret: String,
    pub role: Role,
}

/// Users loaded from a JSON array of [`UserRecord`]s, keyed by name.
#[derive(Debug, Default)]
pub struct FileCredentialStore {
    users: HashMap<String, UserRecord>,
}

impl FileCredentialStore {
    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        let raw = fs::read(path).map_err(CredentialError::Read)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, CredentialError> {
        let records: Vec<UserRecord> =
            serde_json::from_slice(raw).map_err(CredentialError::Decode)?;
        let users = records
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();
        Ok(Self { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialStore for FileCredentialStore {
    fn validate(&self, user: &str, secret: &str) -> Option<Role> {
        self.users
            .get(user)
            .filter(|record| record.secret == secret)
            .map(|record| record.role)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<String, (String, Role)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, name: &str, secret: &str, role: Role) -> Self {
        self.users
            .insert(name.to_string(), (secret.to_string(), role));
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn validate(&self, user: &str, secret: &str) -> Option<Role> {
        self.users
            .get(user)
            .filter(|(stored, _)| stored == secret)
            .map(|(_, role)| *role)
    }
}
