//! The attendance service: identity, registry and ledger behind role checks.

use crate::identity::{IdentityError, IdentityStore, NewUser, Role, User, UserUpdate, UserView};
use crate::ledger::{
    AttendanceLedger, AttendanceRecord, AttendanceStatus, BatchOutcome, DailySummary, LedgerError, Mark, MarkedBy,
};
use crate::registry::{FaceRegistry, RegistryError, RegistryStats};
use crate::store::{
    JsonFileStore, MemoryStore, SqliteStore, Store, StoreError, ATTENDANCE_RECORDS, FACE_REGISTRATIONS, USERS,
};
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{Embedding, FaceTemplate, MatchResult};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("unknown actor {0}")]
    UnknownActor(String),
    #[error("{role} {actor} may not {action}")]
    Forbidden {
        actor: String,
        role: Role,
        action: &'static str,
    },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Backing stores for the three collections.
pub struct Stores {
    pub users: Box<dyn Store<User>>,
    pub faces: Box<dyn Store<FaceTemplate>>,
    pub attendance: Box<dyn Store<AttendanceRecord>>,
}

impl Stores {
    /// One JSON file per collection under `dir`.
    pub fn json(dir: &Path) -> Self {
        Self {
            users: Box::new(JsonFileStore::new(dir, USERS)),
            faces: Box::new(JsonFileStore::new(dir, FACE_REGISTRATIONS)),
            attendance: Box::new(JsonFileStore::new(dir, ATTENDANCE_RECORDS)),
        }
    }

    /// All collections in one SQLite database.
    pub fn sqlite(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            users: Box::new(SqliteStore::open(path, USERS)?),
            faces: Box::new(SqliteStore::open(path, FACE_REGISTRATIONS)?),
            attendance: Box::new(SqliteStore::open(path, ATTENDANCE_RECORDS)?),
        })
    }

    /// Fresh process-local stores.
    pub fn memory() -> Self {
        Self {
            users: Box::new(MemoryStore::<User>::default()),
            faces: Box::new(MemoryStore::<FaceTemplate>::default()),
            attendance: Box::new(MemoryStore::<AttendanceRecord>::default()),
        }
    }
}

/// A registered face without its encoding.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceSummary {
    pub user_id: String,
    pub user_name: String,
    pub registered_at: DateTime<Utc>,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub students: usize,
    pub teachers: usize,
    pub registered_faces: RegistryStats,
    pub today: DailySummary,
}

pub struct AttendanceService {
    identity: IdentityStore,
    registry: FaceRegistry,
    ledger: AttendanceLedger,
}

impl AttendanceService {
    pub fn open(stores: Stores) -> Self {
        Self {
            identity: IdentityStore::open(stores.users),
            registry: FaceRegistry::open(stores.faces),
            ledger: AttendanceLedger::open(stores.attendance),
        }
    }

    fn actor(&self, actor_id: &str) -> Result<&User, ServiceError> {
        self.identity
            .get(actor_id)
            .ok_or_else(|| ServiceError::UnknownActor(actor_id.to_string()))
    }

    fn require(&self, actor_id: &str, action: &'static str, allowed: fn(Role) -> bool) -> Result<&User, ServiceError> {
        let actor = self.actor(actor_id)?;
        if allowed(actor.role) {
            return Ok(actor);
        }
        tracing::warn!(actor = actor_id, role = %actor.role, action, "forbidden");
        Err(ServiceError::Forbidden {
            actor: actor_id.to_string(),
            role: actor.role,
            action,
        })
    }

    fn user(&self, user_id: &str) -> Result<&User, ServiceError> {
        self.identity
            .get(user_id)
            .ok_or_else(|| IdentityError::UnknownUser(user_id.to_string()).into())
    }

    /// Students may only look at themselves.
    fn require_visible(&self, actor_id: &str, user_id: &str) -> Result<(), ServiceError> {
        let actor = self.actor(actor_id)?;
        if actor.role == Role::Student && actor.id != user_id {
            return Err(ServiceError::Forbidden {
                actor: actor_id.to_string(),
                role: actor.role,
                action: "view another user's attendance",
            });
        }
        Ok(())
    }

    pub fn bootstrap_admin(&mut self, password: &str) -> Result<Option<UserView>, ServiceError> {
        Ok(self.identity.bootstrap_admin(password)?.as_ref().map(UserView::from))
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<UserView> {
        self.identity.authenticate(username, password).map(UserView::from)
    }

    pub fn create_user(&mut self, actor_id: &str, new: NewUser) -> Result<UserView, ServiceError> {
        self.require(actor_id, "create users", Role::can_manage_users)?;
        let user = self.identity.create_user(new)?;
        Ok(UserView::from(&user))
    }

    pub fn update_user(&mut self, actor_id: &str, user_id: &str, update: UserUpdate) -> Result<UserView, ServiceError> {
        self.require(actor_id, "edit users", Role::can_manage_users)?;
        let user = self.identity.update(user_id, update)?;
        self.registry.rename_user(&user.id, &user.name);
        Ok(UserView::from(&user))
    }

    /// Delete a user and their face template. Users with attendance history
    /// are kept.
    pub fn remove_user(&mut self, actor_id: &str, user_id: &str) -> Result<UserView, ServiceError> {
        self.require(actor_id, "remove users", Role::can_manage_users)?;
        self.user(user_id)?;
        if self.ledger.has_history(user_id) {
            return Err(IdentityError::UserReferenced(user_id.to_string()).into());
        }
        self.registry.unregister(user_id);
        let removed = self.identity.remove(user_id)?;
        Ok(UserView::from(&removed))
    }

    pub fn list_users(&self, actor_id: &str, role: Option<Role>) -> Result<Vec<UserView>, ServiceError> {
        self.require(actor_id, "list users", Role::can_mark_attendance)?;
        Ok(self
            .identity
            .list()
            .iter()
            .filter(|u| role.map_or(true, |r| u.role == r))
            .map(UserView::from)
            .collect())
    }

    /// One user's profile. Students may only look up themselves.
    pub fn get_user(&self, actor_id: &str, user_id: &str) -> Result<UserView, ServiceError> {
        self.require_visible(actor_id, user_id)?;
        Ok(UserView::from(self.user(user_id)?))
    }

    /// Fails unless `actor_id` may enroll a face for `user_id`, an existing
    /// user. Users may enroll themselves.
    pub fn authorize_enrollment(&self, actor_id: &str, user_id: &str) -> Result<(), ServiceError> {
        if actor_id == user_id {
            self.actor(actor_id)?;
        } else {
            self.require(actor_id, "register faces", Role::can_manage_faces)?;
        }
        self.user(user_id)?;
        Ok(())
    }

    /// Fails unless `actor_id` may run detections and capture sessions.
    pub fn authorize_marking(&self, actor_id: &str) -> Result<(), ServiceError> {
        self.require(actor_id, "take attendance", Role::can_mark_attendance)?;
        Ok(())
    }

    /// Commit a face template for `user_id`.
    pub fn enroll_face(&mut self, actor_id: &str, user_id: &str, encoding: Embedding) -> Result<FaceTemplate, ServiceError> {
        self.authorize_enrollment(actor_id, user_id)?;
        let name = self.user(user_id)?.name.clone();
        Ok(self.registry.register(user_id, &name, encoding)?)
    }

    pub fn unregister_face(&mut self, actor_id: &str, user_id: &str) -> Result<bool, ServiceError> {
        if actor_id == user_id {
            self.actor(actor_id)?;
        } else {
            self.require(actor_id, "remove faces", Role::can_manage_faces)?;
        }
        Ok(self.registry.unregister(user_id))
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.registry.is_registered(user_id)
    }

    pub fn faces(&self, actor_id: &str) -> Result<Vec<FaceSummary>, ServiceError> {
        self.require(actor_id, "list faces", Role::can_manage_faces)?;
        Ok(self
            .registry
            .list_all()
            .iter()
            .map(|t| FaceSummary {
                user_id: t.user_id.clone(),
                user_name: t.user_name.clone(),
                registered_at: t.registered_at,
                dimension: t.encoding.dimension(),
            })
            .collect())
    }

    pub fn face_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Templates for the matching engine.
    pub fn gallery(&self) -> Vec<FaceTemplate> {
        self.registry.gallery()
    }

    pub fn mark(
        &mut self,
        actor_id: &str,
        user_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Result<AttendanceRecord, ServiceError> {
        self.require(actor_id, "mark attendance", Role::can_mark_attendance)?;
        let marked_by = MarkedBy::User(actor_id.to_string());
        Ok(self.ledger.mark(&self.identity, user_id, date, status, marked_by)?)
    }

    /// Mark everyone in one detection pass present, as a single batch.
    pub fn record_detections(&mut self, date: NaiveDate, results: &[MatchResult]) -> BatchOutcome {
        let marks: Vec<Mark> = results
            .iter()
            .map(|r| Mark {
                user_id: r.user_id.clone(),
                status: AttendanceStatus::Present,
                marked_by: MarkedBy::System,
            })
            .collect();
        let outcome = self.ledger.mark_batch(&self.identity, date, &marks);
        for (user_id, error) in &outcome.rejected {
            tracing::warn!(user_id, error = %error, "detected face has no user record");
        }
        outcome
    }

    /// A day's records. Students only see their own.
    pub fn query(&self, actor_id: &str, date: NaiveDate) -> Result<Vec<AttendanceRecord>, ServiceError> {
        let actor = self.actor(actor_id)?;
        let own_only = actor.role == Role::Student;
        Ok(self
            .ledger
            .query(date)
            .into_iter()
            .filter(|r| !own_only || r.user_id == actor.id)
            .cloned()
            .collect())
    }

    pub fn status_of(&self, actor_id: &str, user_id: &str, date: NaiveDate) -> Result<Option<AttendanceStatus>, ServiceError> {
        self.require_visible(actor_id, user_id)?;
        Ok(self.ledger.status_of(user_id, date))
    }

    pub fn history(&self, actor_id: &str, user_id: &str) -> Result<Vec<AttendanceRecord>, ServiceError> {
        self.require_visible(actor_id, user_id)?;
        Ok(self.ledger.history(user_id).into_iter().cloned().collect())
    }

    fn student_summary(&self, date: NaiveDate) -> DailySummary {
        let students = self.identity.list_by_role(Role::Student);
        self.ledger.summary(date, students.iter().map(|u| u.id.as_str()))
    }

    /// Register counters over all students for `date`.
    pub fn summary(&self, actor_id: &str, date: NaiveDate) -> Result<DailySummary, ServiceError> {
        self.require(actor_id, "view the register", Role::can_mark_attendance)?;
        Ok(self.student_summary(date))
    }

    pub fn dashboard(&self, actor_id: &str, today: NaiveDate) -> Result<Dashboard, ServiceError> {
        self.require(actor_id, "view the dashboard", Role::can_mark_attendance)?;
        Ok(Dashboard {
            students: self.identity.list_by_role(Role::Student).len(),
            teachers: self.identity.list_by_role(Role::Teacher).len(),
            registered_faces: self.registry.stats(),
            today: self.student_summary(today),
        })
    }
}
