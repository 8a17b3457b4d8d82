//! rollcall-records — Users, face registrations and daily attendance.
//!
//! Every collection sits behind a [`Store`] so the backend can be a JSON
//! directory, a SQLite file or memory. [`AttendanceService`] owns all three
//! and applies the role rules.

pub mod identity;
pub mod ledger;
pub mod registry;
pub mod service;
pub mod store;

pub use identity::{IdentityError, IdentityStore, NewUser, Role, User, UserDirectory, UserUpdate, UserView};
pub use ledger::{
    AttendanceLedger, AttendanceRecord, AttendanceStatus, BatchOutcome, DailySummary, LedgerError, Mark, MarkedBy,
};
pub use registry::{FaceRegistry, RegistryError, RegistryStats};
pub use service::{AttendanceService, Dashboard, FaceSummary, ServiceError, Stores};
pub use store::{JsonFileStore, MemoryStore, SqliteStore, Store, StoreError};
