use crate::engine::{EngineError, EngineHandle, Probe};
use crate::session::{SessionController, SharedService};
use chrono::{Local, NaiveDate};
use rollcall_records::{AttendanceStatus, NewUser, Role, ServiceError, UserUpdate};
use serde::Serialize;
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every call names its acting user; structured replies are JSON strings.
pub struct AttendanceBus {
    pub service: SharedService,
    pub engine: EngineHandle,
    pub sessions: Arc<SessionController>,
    pub camera_device: String,
    pub storage: String,
    pub match_threshold: f32,
}

fn service_err(e: ServiceError) -> fdo::Error {
    match e {
        ServiceError::UnknownActor(_) | ServiceError::Forbidden { .. } => fdo::Error::AccessDenied(e.to_string()),
        _ => fdo::Error::InvalidArgs(e.to_string()),
    }
}

fn engine_err(e: EngineError) -> fdo::Error {
    if e.is_bad_input() {
        fdo::Error::InvalidArgs(e.to_string())
    } else {
        tracing::warn!(error = %e, "engine request failed");
        fdo::Error::Failed(e.to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

/// `YYYY-MM-DD`; empty or `today` means the local date.
fn parse_date(raw: &str) -> fdo::Result<NaiveDate> {
    match raw.trim() {
        "" | "today" => Ok(Local::now().date_naive()),
        s => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| fdo::Error::InvalidArgs(format!("bad date {s:?}: {e}"))),
    }
}

fn parse_role(raw: &str) -> fdo::Result<Role> {
    raw.parse().map_err(|e: rollcall_records::IdentityError| fdo::Error::InvalidArgs(e.to_string()))
}

/// Empty fields are left unchanged.
fn parse_update(name: &str, role: &str) -> fdo::Result<UserUpdate> {
    let name = match name.trim() {
        "" => None,
        n => Some(n.to_string()),
    };
    let role = match role.trim() {
        "" => None,
        r => Some(parse_role(r)?),
    };
    if name.is_none() && role.is_none() {
        return Err(fdo::Error::InvalidArgs("nothing to update".into()));
    }
    Ok(UserUpdate { name, role })
}

/// Empty bytes mean "use the camera".
fn probe_from(image: Vec<u8>) -> Probe {
    if image.is_empty() {
        Probe::Camera
    } else {
        Probe::Image(image)
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceBus {
    /// Create a user. Only administrators may do this.
    async fn create_user(
        &self,
        actor: &str,
        username: &str,
        name: &str,
        role: &str,
        password: &str,
    ) -> fdo::Result<String> {
        let role = parse_role(role)?;
        let new = NewUser {
            username: username.to_string(),
            name: name.to_string(),
            role,
            password: password.to_string(),
        };
        let user = self.service.lock().await.create_user(actor, new).map_err(service_err)?;
        to_json(&user)
    }

    /// List users, optionally only one role ("" for all).
    async fn list_users(&self, actor: &str, role: &str) -> fdo::Result<String> {
        let role = match role.trim() {
            "" => None,
            r => Some(parse_role(r)?),
        };
        let users = self.service.lock().await.list_users(actor, role).map_err(service_err)?;
        to_json(&users)
    }

    /// Check a username and password. Returns the user, whose id is the
    /// actor id for every other call.
    async fn authenticate(&self, username: &str, password: &str) -> fdo::Result<String> {
        let user = self.service.lock().await.authenticate(username, password);
        match user {
            Some(user) => {
                tracing::info!(user_id = %user.id, "login succeeded");
                to_json(&user)
            }
            None => {
                tracing::warn!(username, "login failed");
                Err(fdo::Error::AccessDenied("invalid username or password".into()))
            }
        }
    }

    async fn get_user(&self, actor: &str, user_id: &str) -> fdo::Result<String> {
        let user = self.service.lock().await.get_user(actor, user_id).map_err(service_err)?;
        to_json(&user)
    }

    /// Change a user's name and/or role ("" leaves a field unchanged).
    async fn update_user(&self, actor: &str, user_id: &str, name: &str, role: &str) -> fdo::Result<String> {
        let update = parse_update(name, role)?;
        let user = self
            .service
            .lock()
            .await
            .update_user(actor, user_id, update)
            .map_err(service_err)?;
        to_json(&user)
    }

    /// Delete a user and their face registration. Refused while attendance
    /// history references them.
    async fn remove_user(&self, actor: &str, user_id: &str) -> fdo::Result<String> {
        let user = self.service.lock().await.remove_user(actor, user_id).map_err(service_err)?;
        tracing::info!(actor, user_id, "user removed");
        to_json(&user)
    }

    /// Enroll a face from image bytes, or from the camera when `image` is empty.
    async fn register_face(&self, actor: &str, user_id: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(actor, user_id, from_camera = image.is_empty(), "register face requested");
        self.service
            .lock()
            .await
            .authorize_enrollment(actor, user_id)
            .map_err(service_err)?;

        let encoding = self.engine.enroll(probe_from(image)).await.map_err(engine_err)?;
        let template = self
            .service
            .lock()
            .await
            .enroll_face(actor, user_id, encoding.embedding)
            .map_err(service_err)?;

        to_json(&serde_json::json!({
            "userId": template.user_id,
            "userName": template.user_name,
            "registeredAt": template.registered_at,
            "detectionConfidence": encoding.region.confidence,
        }))
    }

    /// Remove a user's face template. Returns false if none existed.
    async fn unregister_face(&self, actor: &str, user_id: &str) -> fdo::Result<bool> {
        self.service
            .lock()
            .await
            .unregister_face(actor, user_id)
            .map_err(service_err)
    }

    async fn list_faces(&self, actor: &str) -> fdo::Result<String> {
        let faces = self.service.lock().await.faces(actor).map_err(service_err)?;
        to_json(&faces)
    }

    /// Run one detection. With `mark`, everyone recognized is marked present.
    async fn detect(&self, actor: &str, image: Vec<u8>, mark: bool) -> fdo::Result<String> {
        let gallery = {
            let service = self.service.lock().await;
            service.authorize_marking(actor).map_err(service_err)?;
            service.gallery()
        };

        let results = self
            .engine
            .detect(probe_from(image), gallery)
            .await
            .map_err(engine_err)?;

        let marked = if mark && !results.is_empty() {
            let today = Local::now().date_naive();
            self.service.lock().await.record_detections(today, &results).applied.len()
        } else {
            0
        };
        tracing::info!(actor, matches = results.len(), marked, "detect finished");

        to_json(&serde_json::json!({ "results": results, "marked": marked }))
    }

    async fn mark(&self, actor: &str, user_id: &str, date: &str, status: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let status: AttendanceStatus = status
            .parse()
            .map_err(|e: rollcall_records::LedgerError| fdo::Error::InvalidArgs(e.to_string()))?;
        let record = self
            .service
            .lock()
            .await
            .mark(actor, user_id, date, status)
            .map_err(service_err)?;
        to_json(&record)
    }

    async fn query(&self, actor: &str, date: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let records = self.service.lock().await.query(actor, date).map_err(service_err)?;
        to_json(&records)
    }

    /// Status for one user and day, or "" when unmarked.
    async fn status_of(&self, actor: &str, user_id: &str, date: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let status = self
            .service
            .lock()
            .await
            .status_of(actor, user_id, date)
            .map_err(service_err)?;
        Ok(status.map(|s| s.to_string()).unwrap_or_default())
    }

    async fn history(&self, actor: &str, user_id: &str) -> fdo::Result<String> {
        let records = self.service.lock().await.history(actor, user_id).map_err(service_err)?;
        to_json(&records)
    }

    async fn summary(&self, actor: &str, date: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let summary = self.service.lock().await.summary(actor, date).map_err(service_err)?;
        to_json(&summary)
    }

    async fn dashboard(&self, actor: &str) -> fdo::Result<String> {
        let today = Local::now().date_naive();
        let dashboard = self.service.lock().await.dashboard(actor, today).map_err(service_err)?;
        to_json(&dashboard)
    }

    /// Begin continuous detection. Returns false if a session is already running.
    async fn start_session(&self, actor: &str) -> fdo::Result<bool> {
        self.service.lock().await.authorize_marking(actor).map_err(service_err)?;
        let started = self.sessions.start().await.map_err(engine_err)?;
        tracing::info!(actor, started, "start session requested");
        Ok(started)
    }

    /// End continuous detection. Returns false if none was running.
    async fn stop_session(&self, actor: &str) -> fdo::Result<bool> {
        self.service.lock().await.authorize_marking(actor).map_err(service_err)?;
        let stopped = self.sessions.stop().await;
        tracing::info!(actor, stopped, "stop session requested");
        Ok(stopped)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let session = self.sessions.status().await;
        let faces = self.service.lock().await.face_stats();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "storage": self.storage,
            "matchThreshold": self.match_threshold,
            "registeredFaces": faces,
            "session": session,
        }))
    }
}
