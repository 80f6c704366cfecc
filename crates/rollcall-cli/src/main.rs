use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, MotorTrigger};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start_session(&self, target: &str) -> zbus::Result<bool>;
    fn start_enrollment(&self, name: &str) -> zbus::Result<bool>;
    fn stop(&self) -> zbus::Result<()>;
    fn list_students(&self) -> zbus::Result<String>;
    fn remove_student(&self, name: &str) -> zbus::Result<bool>;
    fn list_targets(&self) -> zbus::Result<String>;
    fn create_target(&self, name: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn save_snapshot(&self, path: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start marking attendance into a sheet
    Session {
        /// Sheet name (see `rollcall targets`)
        target: String,
    },
    /// Enroll a student from the live camera
    Enroll {
        name: String,
    },
    /// Stop capturing
    Stop,
    /// List enrolled students
    List,
    /// Remove an enrolled student
    Remove {
        name: String,
    },
    /// List attendance sheets
    Targets,
    /// Create an empty attendance sheet
    AddTarget {
        name: String,
    },
    /// Show daemon status
    Status,
    /// Save the latest annotated frame as an image
    Snapshot {
        path: PathBuf,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Where to write the captured frame
        #[arg(short, long, default_value = "rollcall-test.png")]
        output: PathBuf,
    },
    /// Fire the motor trigger directly (bypasses the daemon)
    Trigger {
        /// Serial port; auto-detects an Arduino Uno if omitted
        #[arg(short, long)]
        port: Option<PathBuf>,
        #[arg(short, long, default_value_t = rollcall_hw::trigger::DEFAULT_BAUD)]
        baud: u32,
    },
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("cannot reach rollcalld; is it running?")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Session { target } => {
            if !connect().await?.start_session(&target).await? {
                bail!("could not start a session on sheet {target:?}");
            }
            println!("Attendance session started on {target}");
        }
        Commands::Enroll { name } => {
            if !connect().await?.start_enrollment(&name).await? {
                bail!("could not start enrollment for {name:?}");
            }
            println!("Enrolling {name}; look at the camera");
        }
        Commands::Stop => {
            connect().await?.stop().await?;
            println!("Stopped");
        }
        Commands::List => {
            let raw = connect().await?.list_students().await?;
            let students: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
            if students.is_empty() {
                println!("No students enrolled");
            }
            for s in students {
                println!("{}\t{} samples", s["name"].as_str().unwrap_or("?"), s["samples"]);
            }
        }
        Commands::Remove { name } => {
            if connect().await?.remove_student(&name).await? {
                println!("Removed {name}");
            } else {
                println!("No student named {name}");
            }
        }
        Commands::Targets => {
            let raw = connect().await?.list_targets().await?;
            let targets: Vec<String> = serde_json::from_str(&raw)?;
            if targets.is_empty() {
                println!("No attendance sheets");
            }
            for t in targets {
                println!("{t}");
            }
        }
        Commands::AddTarget { name } => {
            if connect().await?.create_target(&name).await? {
                println!("Created sheet {name}");
            } else {
                println!("Sheet {name} already exists");
            }
        }
        Commands::Status => {
            let raw = connect().await?.status().await?;
            print_json(&raw)?;
        }
        Commands::Snapshot { path } => {
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            let saved = connect()
                .await?
                .save_snapshot(&path.to_string_lossy())
                .await?;
            if !saved {
                bail!("no frame captured yet; start a session or enrollment first");
            }
            println!("Saved {}", path.display());
        }
        Commands::Test { device, output } => {
            println!("Running camera diagnostics...");
            for info in Camera::list_devices() {
                println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
            }

            let camera = Camera::open(&device).with_context(|| format!("failed to open {device}"))?;
            println!(
                "Opened {device}: {}x{} {:?}",
                camera.width, camera.height, camera.fourcc
            );

            let frame = camera.capture_frame().context("failed to capture a frame")?;
            println!(
                "Captured frame #{}: {}x{}, mean brightness {:.1}",
                frame.sequence,
                frame.width(),
                frame.height(),
                frame.avg_brightness()
            );
            frame
                .image
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
        Commands::Trigger { port, baud } => {
            let trigger = MotorTrigger::new(port, baud);
            let port = tokio::task::spawn_blocking(move || trigger.fire()).await??;
            println!("Sent START to {}", port.display());
        }
    }

    Ok(())
}
