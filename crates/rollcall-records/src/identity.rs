//! User accounts and roles.

use crate::store::{self, Store};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_USERNAME_LEN: usize = 3;
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    pub fn can_manage_users(self) -> bool {
        self == Role::Admin
    }

    pub fn can_mark_attendance(self) -> bool {
        matches!(self, Role::Admin | Role::Teacher)
    }

    pub fn can_manage_faces(self) -> bool {
        matches!(self, Role::Admin | Role::Teacher)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(IdentityError::UnknownRole(other.to_string())),
        }
    }
}

/// Salted SHA-256 password digest, hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    salt: String,
    digest: String,
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl Credential {
    pub fn derive(password: &str) -> Self {
        let salt: [u8; 16] = rand::thread_rng().gen();
        let salt = hex::encode(salt);
        let digest = digest(&salt, password);
        Self { salt, digest }
    }

    /// Compares every byte regardless of where the first mismatch is.
    pub fn verify(&self, password: &str) -> bool {
        let candidate = digest(&self.salt, password);
        candidate.len() == self.digest.len()
            && candidate
                .bytes()
                .zip(self.digest.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

/// A user as shown to callers: never carries the credential.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub username: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            name: user.name.clone(),
            role: user.role,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub name: String,
    pub role: Role,
    pub password: String,
}

/// Administrative edit; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub role: Option<Role>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("full name is required")]
    NameRequired,
    #[error("username must be at least {MIN_USERNAME_LEN} characters")]
    UsernameTooShort,
    #[error("username {0:?} is already taken")]
    UsernameTaken(String),
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    PasswordTooShort,
    #[error("unknown role {0:?}")]
    UnknownRole(String),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("user {0} still has attendance history")]
    UserReferenced(String),
}

/// Read access to users, as needed by the ledger.
pub trait UserDirectory {
    fn user(&self, id: &str) -> Option<&User>;

    fn contains(&self, id: &str) -> bool {
        self.user(id).is_some()
    }
}

pub struct IdentityStore {
    users: Vec<User>,
    store: Box<dyn Store<User>>,
}

impl IdentityStore {
    pub fn open(store: Box<dyn Store<User>>) -> Self {
        let users = store::load_or_empty(store.as_ref());
        tracing::debug!(count = users.len(), "loaded users");
        Self { users, store }
    }

    fn persist(&self) {
        store::save_logged(self.store.as_ref(), &self.users);
    }

    /// Next id after the largest numeric id in use.
    fn next_id(&self) -> String {
        let max = self
            .users
            .iter()
            .filter_map(|u| u.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }

    pub fn create_user(&mut self, new: NewUser) -> Result<User, IdentityError> {
        let name = new.name.trim();
        let username = new.username.trim();

        if name.is_empty() {
            return Err(IdentityError::NameRequired);
        }
        if username.chars().count() < MIN_USERNAME_LEN {
            return Err(IdentityError::UsernameTooShort);
        }
        if new.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(IdentityError::PasswordTooShort);
        }
        if self.find_by_username(username).is_some() {
            return Err(IdentityError::UsernameTaken(username.to_string()));
        }

        let user = User {
            id: self.next_id(),
            username: username.to_string(),
            name: name.to_string(),
            role: new.role,
            created_at: Utc::now(),
            credential: Some(Credential::derive(&new.password)),
        };
        self.users.push(user.clone());
        self.persist();

        tracing::info!(user_id = %user.id, username = %user.username, role = %user.role, "user created");
        Ok(user)
    }

    /// Create the first administrator when no users exist yet.
    pub fn bootstrap_admin(&mut self, password: &str) -> Result<Option<User>, IdentityError> {
        if !self.users.is_empty() {
            return Ok(None);
        }
        let admin = self.create_user(NewUser {
            username: "admin".into(),
            name: "System Administrator".into(),
            role: Role::Admin,
            password: password.to_string(),
        })?;
        tracing::warn!(user_id = %admin.id, "bootstrapped administrator account; change its password");
        Ok(Some(admin))
    }

    pub fn get(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn find_by_username(&self, username: &str) -> Option<&User> {
        let username = username.trim();
        self.users.iter().find(|u| u.username.eq_ignore_ascii_case(username))
    }

    pub fn list(&self) -> &[User] {
        &self.users
    }

    pub fn list_by_role(&self, role: Role) -> Vec<&User> {
        self.users.iter().filter(|u| u.role == role).collect()
    }

    pub fn update(&mut self, id: &str, update: UserUpdate) -> Result<User, IdentityError> {
        let name = match update.name.as_deref().map(str::trim) {
            Some("") => return Err(IdentityError::NameRequired),
            other => other.map(str::to_string),
        };
        let user = self
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| IdentityError::UnknownUser(id.to_string()))?;

        if let Some(name) = name {
            user.name = name;
        }
        if let Some(role) = update.role {
            user.role = role;
        }
        let updated = user.clone();
        self.persist();

        tracing::info!(user_id = %updated.id, role = %updated.role, "user updated");
        Ok(updated)
    }

    /// Delete a user. Callers check references first.
    pub fn remove(&mut self, id: &str) -> Result<User, IdentityError> {
        let pos = self
            .users
            .iter()
            .position(|u| u.id == id)
            .ok_or_else(|| IdentityError::UnknownUser(id.to_string()))?;
        let removed = self.users.remove(pos);
        self.persist();

        tracing::info!(user_id = %removed.id, "user removed");
        Ok(removed)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<&User> {
        let user = self.find_by_username(username)?;
        let ok = user.credential.as_ref().is_some_and(|c| c.verify(password));
        if !ok {
            tracing::info!(username, "authentication failed");
        }
        ok.then_some(user)
    }
}

impl UserDirectory for IdentityStore {
    fn user(&self, id: &str) -> Option<&User> {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn new_user(username: &str, role: Role) -> NewUser {
        NewUser {
            username: username.into(),
            name: format!("{username} name"),
            role,
            password: "secret123".into(),
        }
    }

    fn store() -> (IdentityStore, MemoryStore<User>) {
        let backing = MemoryStore::default();
        (IdentityStore::open(Box::new(backing.clone())), backing)
    }

    #[test]
    fn test_create_user_allocates_sequential_ids() {
        let (mut ids, backing) = store();
        let a = ids.create_user(new_user("admin", Role::Admin)).unwrap();
        let b = ids.create_user(new_user("teacher1", Role::Teacher)).unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");
        assert_eq!(backing.snapshot().len(), 2);
    }

    #[test]
    fn test_validation_rules() {
        let (mut ids, _) = store();
        let mut u = new_user("ab", Role::Student);
        assert_eq!(ids.create_user(u.clone()).unwrap_err(), IdentityError::UsernameTooShort);

        u.username = "alice".into();
        u.password = "12345".into();
        assert_eq!(ids.create_user(u.clone()).unwrap_err(), IdentityError::PasswordTooShort);

        u.password = "123456".into();
        u.name = "   ".into();
        assert_eq!(ids.create_user(u.clone()).unwrap_err(), IdentityError::NameRequired);

        u.name = "Alice".into();
        ids.create_user(u.clone()).unwrap();
        u.username = "ALICE".into();
        assert_eq!(ids.create_user(u).unwrap_err(), IdentityError::UsernameTaken("ALICE".into()));
    }

    #[test]
    fn test_password_is_never_stored_in_plaintext() {
        let (mut ids, backing) = store();
        ids.create_user(new_user("student1", Role::Student)).unwrap();
        let json = serde_json::to_string(&backing.snapshot()).unwrap();
        assert!(!json.contains("secret123"));
    }

    #[test]
    fn test_credential_is_hex_encoded_sha256() {
        let credential = Credential::derive("secret123");
        assert_eq!(credential.salt.len(), 32);
        assert_eq!(credential.digest.len(), 64);
        assert!(hex::decode(&credential.digest).is_ok());
        assert!(credential.verify("secret123"));
        assert!(!credential.verify("secret124"));
    }

    #[test]
    fn test_authenticate() {
        let (mut ids, _) = store();
        ids.create_user(new_user("student1", Role::Student)).unwrap();
        assert!(ids.authenticate("student1", "secret123").is_some());
        assert!(ids.authenticate("student1", "wrong-password").is_none());
        assert!(ids.authenticate("nobody", "secret123").is_none());
    }

    #[test]
    fn test_ids_continue_after_reload() {
        let backing = MemoryStore::default();
        let mut first = IdentityStore::open(Box::new(backing.clone()));
        first.create_user(new_user("admin", Role::Admin)).unwrap();

        let mut second = IdentityStore::open(Box::new(backing));
        let next = second.create_user(new_user("teacher1", Role::Teacher)).unwrap();
        assert_eq!(next.id, "2");
    }

    #[test]
    fn test_update_and_remove() {
        let (mut ids, _) = store();
        let u = ids.create_user(new_user("student1", Role::Student)).unwrap();

        let updated = ids
            .update(&u.id, UserUpdate { name: Some("Alice Johnson".into()), role: None })
            .unwrap();
        assert_eq!(updated.name, "Alice Johnson");
        assert_eq!(updated.role, Role::Student);
        assert_eq!(
            ids.update(&u.id, UserUpdate { name: Some(" ".into()), role: None }).unwrap_err(),
            IdentityError::NameRequired
        );

        ids.remove(&u.id).unwrap();
        assert!(ids.get(&u.id).is_none());
        assert_eq!(ids.remove(&u.id).unwrap_err(), IdentityError::UnknownUser(u.id.clone()));
    }

    #[test]
    fn test_bootstrap_admin_only_when_empty() {
        let (mut ids, _) = store();
        let admin = ids.bootstrap_admin("admin123").unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(ids.bootstrap_admin("admin123").unwrap().is_none());
    }

    #[test]
    fn test_role_parsing_and_permissions() {
        assert_eq!("Teacher".parse::<Role>(), Ok(Role::Teacher));
        assert!("janitor".parse::<Role>().is_err());
        assert!(Role::Admin.can_manage_users());
        assert!(!Role::Teacher.can_manage_users());
        assert!(Role::Teacher.can_mark_attendance());
        assert!(!Role::Student.can_mark_attendance());
    }

    #[test]
    fn test_loads_legacy_records_without_credentials() {
        let legacy = r#"[{"id":"3","username":"student1","name":"Alice Johnson","role":"student","createdAt":"2025-01-03T00:00:00Z"}]"#;
        let users: Vec<User> = serde_json::from_str(legacy).unwrap();
        let ids = IdentityStore::open(Box::new(MemoryStore::with_items(users)));
        assert_eq!(ids.list_by_role(Role::Student).len(), 1);
        assert!(ids.authenticate("student1", "student123").is_none());
    }
}
