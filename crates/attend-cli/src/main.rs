use anyhow::{Context, Result};
use attend_core::AttendanceKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.attend.Kiosk1",
    default_service = "org.attend.Kiosk1",
    default_path = "/org/attend/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn sync(&self) -> zbus::Result<String>;
    async fn sync_employees(&self) -> zbus::Result<bool>;
    async fn sync_attendance(&self) -> zbus::Result<String>;
    async fn list_pending(&self) -> zbus::Result<String>;
    async fn lookup_employee(&self, employee_code: &str) -> zbus::Result<String>;
    async fn verify_face(&self, employee_code: &str, embedding: Vec<f64>) -> zbus::Result<String>;
    async fn record_attendance(
        &self,
        employee_code: &str,
        kind: &str,
        confidence: f64,
    ) -> zbus::Result<i64>;
    async fn report_link(&self, online: bool) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "attend", about = "Attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status
    Status,
    /// Run a full sync now
    Sync {
        /// Only pull the employee snapshot
        #[arg(long, conflicts_with = "attendance")]
        employees: bool,
        /// Only push queued attendance
        #[arg(long)]
        attendance: bool,
    },
    /// List attendance waiting to be uploaded
    Pending,
    /// Show a cached employee
    Lookup {
        /// Employee code
        code: String,
    },
    /// Verify a face embedding against the cached references
    Verify {
        /// Employee code
        code: String,
        /// JSON file holding the embedding as an array of numbers
        embedding: PathBuf,
    },
    /// Queue a check-in or check-out
    Record {
        /// Employee code
        code: String,
        /// check-in or check-out
        #[arg(short, long, default_value_t = AttendanceKind::CheckIn)]
        kind: AttendanceKind,
        /// Match confidence reported with the record
        #[arg(short, long, default_value_t = 1.0)]
        confidence: f64,
    },
    /// Report the network link state to the daemon
    Link {
        #[arg(value_enum)]
        state: LinkState,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkState {
    Online,
    Offline,
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn read_embedding(path: &PathBuf) -> Result<Vec<f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON number array", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    // A full sync makes two bounded requests; leave room for both.
    let conn = builder
        .method_timeout(Duration::from_secs(120))
        .build()
        .await
        .context("cannot connect to D-Bus")?;
    let proxy = KioskProxy::new(&conn).await?;
    tracing::debug!(session = cli.session, "connected to attendd");

    match cli.command {
        Commands::Status => print_json(&proxy.status().await.context("attendd not reachable")?)?,
        Commands::Sync {
            employees: true, ..
        } => {
            if proxy.sync_employees().await? {
                println!("Employee snapshot cached");
            } else {
                println!("Employee sync did not run or failed; see `attend status`");
            }
        }
        Commands::Sync {
            attendance: true, ..
        } => print_json(&proxy.sync_attendance().await?)?,
        Commands::Sync { .. } => print_json(&proxy.sync().await?)?,
        Commands::Pending => print_json(&proxy.list_pending().await?)?,
        Commands::Lookup { code } => {
            let raw = proxy.lookup_employee(&code).await?;
            if raw == "null" {
                println!("No cached employee with code {code}");
            } else {
                print_json(&raw)?;
            }
        }
        Commands::Verify { code, embedding } => {
            let embedding = read_embedding(&embedding)?;
            print_json(&proxy.verify_face(&code, embedding).await?)?;
        }
        Commands::Record {
            code,
            kind,
            confidence,
        } => {
            let id = proxy.record_attendance(&code, kind.as_str(), confidence).await?;
            println!("Queued {kind} for {code} (local id {id})");
        }
        Commands::Link { state } => {
            let online = matches!(state, LinkState::Online);
            proxy.report_link(online).await?;
            println!("Reported link {}", if online { "online" } else { "offline" });
        }
    }

    Ok(())
}
