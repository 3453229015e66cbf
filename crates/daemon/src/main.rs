use clap::Parser;
use daemon::allocator::{Allocator, BoxConfig};
use daemon::db::{self, LeaseStore};
use daemon::reconciler::Reconciler;
use daemon::runtime::DockerRuntime;
use daemon::server::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// On-demand challenge box broker: hands out one short-lived container per
/// client IP and reaps the bookkeeping once the container dies.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Container image to run
    #[arg(long, default_value = "ubuntu")]
    image: String,

    /// Command to send to the background inside the container
    #[arg(long = "cmd", default_value = "/usr/sbin/sshd")]
    command: String,

    /// Container port to publish on a dynamic host port
    #[arg(long, default_value_t = 22)]
    port: u16,

    /// Seconds before the box self-terminates
    #[arg(long = "life", default_value_t = 60)]
    lifespan: u64,

    /// Address:port the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Lease database path (default: ~/.boxbroker/state.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory served as the landing page
    #[arg(long, default_value = "./static")]
    static_dir: PathBuf,

    /// Seconds between reconciliation sweeps
    #[arg(long, default_value_t = 10)]
    sweep_interval: u64,

    /// Upper bound on one sweep before it is abandoned, in seconds
    #[arg(long, default_value_t = 60)]
    sweep_budget: u64,

    /// Per-call timeout for the container runtime, in seconds
    #[arg(long, default_value_t = 30)]
    runtime_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let db_path = args.db.unwrap_or_else(db::default_db_path);
    info!(db = %db_path.display(), "opening lease store");
    let store = LeaseStore::open(&db_path).expect("failed to open lease store");

    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .expect("container runtime unreachable"),
    );

    let config = BoxConfig {
        image: args.image,
        command: args.command,
        exposed_port: args.port,
        lifespan_seconds: args.lifespan,
    };
    let allocator = Arc::new(Allocator::new(
        store.clone(),
        runtime.clone(),
        config,
        Duration::from_secs(args.runtime_timeout),
    ));

    // The first tick fires immediately, evicting leases left over from a
    // previous process life.
    let reconciler = Reconciler::new(store, runtime, Duration::from_secs(args.sweep_budget));
    tokio::spawn(reconciler.run(Duration::from_secs(args.sweep_interval)));

    let app = server::app(AppState { allocator }, Some(&args.static_dir));

    info!(listen = %args.listen, "challenge box broker listening");
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .expect("failed to bind listen address");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
