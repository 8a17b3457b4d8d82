use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn create_user(&self, actor: &str, username: &str, name: &str, role: &str, password: &str)
        -> zbus::Result<String>;
    async fn list_users(&self, actor: &str, role: &str) -> zbus::Result<String>;
    async fn authenticate(&self, username: &str, password: &str) -> zbus::Result<String>;
    async fn get_user(&self, actor: &str, user_id: &str) -> zbus::Result<String>;
    async fn update_user(&self, actor: &str, user_id: &str, name: &str, role: &str) -> zbus::Result<String>;
    async fn remove_user(&self, actor: &str, user_id: &str) -> zbus::Result<String>;
    async fn register_face(&self, actor: &str, user_id: &str, image: &[u8]) -> zbus::Result<String>;
    async fn unregister_face(&self, actor: &str, user_id: &str) -> zbus::Result<bool>;
    async fn list_faces(&self, actor: &str) -> zbus::Result<String>;
    async fn detect(&self, actor: &str, image: &[u8], mark: bool) -> zbus::Result<String>;
    async fn mark(&self, actor: &str, user_id: &str, date: &str, status: &str) -> zbus::Result<String>;
    async fn query(&self, actor: &str, date: &str) -> zbus::Result<String>;
    async fn status_of(&self, actor: &str, user_id: &str, date: &str) -> zbus::Result<String>;
    async fn history(&self, actor: &str, user_id: &str) -> zbus::Result<String>;
    async fn summary(&self, actor: &str, date: &str) -> zbus::Result<String>;
    async fn dashboard(&self, actor: &str) -> zbus::Result<String>;
    async fn start_session(&self, actor: &str) -> zbus::Result<bool>;
    async fn stop_session(&self, actor: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Acting user id (falls back to $ROLLCALL_ACTOR)
    #[arg(long, global = true)]
    actor: Option<String>,
    /// Talk to a daemon on the system bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage users
    #[command(subcommand)]
    User(UserCommand),
    /// Manage face registrations
    #[command(subcommand)]
    Face(FaceCommand),
    /// Recognize faces in one capture
    Detect {
        /// Image file to use instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Mark everyone recognized as present
        #[arg(long)]
        mark: bool,
    },
    /// Mark a user's attendance
    Mark {
        user_id: String,
        /// present, absent or late
        status: String,
        /// YYYY-MM-DD (default: today)
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Show the register for a day
    Query {
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Show one user's attendance history, or their status on a day
    History {
        user_id: String,
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show register counters for a day
    Summary {
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Show school-wide counters for today
    Dashboard,
    /// Control continuous camera attendance
    #[command(subcommand)]
    Session(SessionCommand),
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    CameraTest {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Usable frames to capture
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        /// Save the last frame as PNG
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Create a user (administrators only)
    Add {
        #[arg(short, long)]
        username: String,
        /// Full name
        #[arg(short, long)]
        name: String,
        /// admin, teacher or student
        #[arg(short, long, default_value = "student")]
        role: String,
        #[arg(short, long)]
        password: String,
    },
    /// List users
    List {
        #[arg(short, long, default_value = "")]
        role: String,
    },
    /// Check credentials and print the user id to act as
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Show one user
    Show { user_id: String },
    /// Change a user's name or role (administrators only)
    Edit {
        user_id: String,
        #[arg(short, long, default_value = "")]
        name: String,
        #[arg(short, long, default_value = "")]
        role: String,
    },
    /// Delete a user without attendance history (administrators only)
    Remove { user_id: String },
}

#[derive(Subcommand)]
enum FaceCommand {
    /// Register a user's face
    Enroll {
        user_id: String,
        /// Image file with exactly one face; default captures from the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Remove a user's face registration
    Remove { user_id: String },
    /// List registered faces
    List,
}

#[derive(Subcommand)]
enum SessionCommand {
    Start,
    Stop,
}

fn read_image(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display())),
        None => Ok(Vec::new()),
    }
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_records(raw: &str) -> Result<()> {
    let records: Vec<serde_json::Value> = serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    if records.is_empty() {
        println!("No attendance recorded");
        return Ok(());
    }
    println!("{:<10} {:<12} {:<8} {:<10} TIME", "USER", "DATE", "STATUS", "MARKED BY");
    for r in &records {
        println!(
            "{:<10} {:<12} {:<8} {:<10} {}",
            r["userId"].as_str().unwrap_or("?"),
            r["date"].as_str().unwrap_or("?"),
            r["status"].as_str().unwrap_or("?"),
            r["markedBy"].as_str().unwrap_or("?"),
            r["timestamp"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

fn actor_of(cli: &Cli) -> Result<String> {
    match cli.actor.clone().or_else(|| std::env::var("ROLLCALL_ACTOR").ok()) {
        Some(actor) if !actor.trim().is_empty() => Ok(actor),
        _ => bail!("no acting user: pass --actor <id> or set ROLLCALL_ACTOR"),
    }
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(system, "connected to D-Bus");
    AttendanceProxy::new(&conn).await.context("rollcalld is not reachable")
}

fn camera_test(device: &str, width: u32, height: u32, frames: usize, save: Option<&Path>) -> Result<()> {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("{:<14} {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let camera = rollcall_hw::Camera::open(device, width, height)?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );

    let start = std::time::Instant::now();
    let (captured, dark) = camera.capture_usable(frames)?;
    let elapsed = start.elapsed();
    println!(
        "Captured {} usable frames, skipped {} dark, in {:.0?}",
        captured.len(),
        dark,
        elapsed
    );
    for frame in &captured {
        println!("  #{:<5} brightness {:6.1}", frame.sequence, frame.avg_brightness());
    }

    if let Some(path) = save {
        let Some(frame) = captured.last() else {
            bail!("no usable frame to save");
        };
        frame
            .to_image()?
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("saving {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::CameraTest { device, width, height, frames, save } = &cli.command {
        return camera_test(device, *width, *height, *frames, save.as_deref());
    }
    if let Commands::Status = &cli.command {
        return print_json(&connect(cli.system).await?.status().await?);
    }
    if let Commands::User(UserCommand::Login { username, password }) = &cli.command {
        let raw = connect(cli.system).await?.authenticate(username, password).await?;
        let user: serde_json::Value = serde_json::from_str(&raw).context("daemon returned malformed JSON")?;
        let id = user["id"].as_str().unwrap_or("?");
        println!("Logged in as {} ({})", user["name"].as_str().unwrap_or("?"), user["role"].as_str().unwrap_or("?"));
        println!("export ROLLCALL_ACTOR={id}");
        return Ok(());
    }

    let actor = actor_of(&cli)?;
    let proxy = connect(cli.system).await?;

    match cli.command {
        Commands::User(UserCommand::Add { username, name, role, password }) => {
            print_json(&proxy.create_user(&actor, &username, &name, &role, &password).await?)?;
        }
        Commands::User(UserCommand::List { role }) => {
            let users: Vec<serde_json::Value> = serde_json::from_str(&proxy.list_users(&actor, &role).await?)?;
            for u in &users {
                println!(
                    "{:<6} {:<16} {:<8} {}",
                    u["id"].as_str().unwrap_or("?"),
                    u["username"].as_str().unwrap_or("?"),
                    u["role"].as_str().unwrap_or("?"),
                    u["name"].as_str().unwrap_or("?"),
                );
            }
        }
        Commands::User(UserCommand::Show { user_id }) => print_json(&proxy.get_user(&actor, &user_id).await?)?,
        Commands::User(UserCommand::Edit { user_id, name, role }) => {
            if name.is_empty() && role.is_empty() {
                bail!("nothing to change: pass --name and/or --role");
            }
            print_json(&proxy.update_user(&actor, &user_id, &name, &role).await?)?;
        }
        Commands::User(UserCommand::Remove { user_id }) => {
            proxy.remove_user(&actor, &user_id).await?;
            println!("Removed user {user_id}");
        }
        Commands::Face(FaceCommand::Enroll { user_id, image }) => {
            if image.is_none() {
                println!("Look at the camera...");
            }
            let bytes = read_image(image.as_deref())?;
            print_json(&proxy.register_face(&actor, &user_id, &bytes).await?)?;
        }
        Commands::Face(FaceCommand::Remove { user_id }) => {
            if proxy.unregister_face(&actor, &user_id).await? {
                println!("Removed face registration for {user_id}");
            } else {
                println!("No face registered for {user_id}");
            }
        }
        Commands::Face(FaceCommand::List) => print_json(&proxy.list_faces(&actor).await?)?,
        Commands::Detect { image, mark } => {
            let bytes = read_image(image.as_deref())?;
            print_json(&proxy.detect(&actor, &bytes, mark).await?)?;
        }
        Commands::Mark { user_id, status, date } => {
            print_json(&proxy.mark(&actor, &user_id, &date, &status).await?)?;
        }
        Commands::Query { date } => print_records(&proxy.query(&actor, &date).await?)?,
        Commands::History { user_id, date: Some(date) } => {
            let status = proxy.status_of(&actor, &user_id, &date).await?;
            println!("{}", if status.is_empty() { "unmarked" } else { status.as_str() });
        }
        Commands::History { user_id, date: None } => print_records(&proxy.history(&actor, &user_id).await?)?,
        Commands::Summary { date } => print_json(&proxy.summary(&actor, &date).await?)?,
        Commands::Dashboard => print_json(&proxy.dashboard(&actor).await?)?,
        Commands::Session(SessionCommand::Start) => {
            if proxy.start_session(&actor).await? {
                println!("Session started");
            } else {
                println!("Session already running");
            }
        }
        Commands::Session(SessionCommand::Stop) => {
            if proxy.stop_session(&actor).await? {
                println!("Session stopped");
            } else {
                println!("No session running");
            }
        }
        Commands::Status | Commands::CameraTest { .. } | Commands::User(UserCommand::Login { .. }) => {}
    }

    Ok(())
}
