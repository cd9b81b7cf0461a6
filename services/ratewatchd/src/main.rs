use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use admin_ipc::{run_server, AdminRequest, AdminResponse, AdminStatus, DEFAULT_SOCKET_PATH};
use anyhow::bail;
use chrono::NaiveTime;
use clap::Parser;
use metrics::MetricsHandle;
use notify::{LogNotifier, TelegramConfig, TelegramNotifier};
use publisher::{FetcherConfig, PublisherFetcher};
use reading::Notifier;
use scheduler::{
    utc_offset_from_minutes, Collaborators, PollRequest, ScheduleConfig, Scheduler,
    StatusSnapshot, SystemClock, DEFAULT_UTC_OFFSET_MINUTES,
};
use storage::{LocalCache, Store};
use tokio::sync::{mpsc, watch};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "SQLITE_PATH", default_value = "sqlite://ratewatch.db")]
    sqlite_path: String,

    #[arg(long, env = "CACHE_PATH", default_value = "ratewatch-last.json")]
    cache_path: PathBuf,

    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    admin_socket: String,

    #[arg(long, env = "METRICS_ADDR", default_value = "127.0.0.1:9110")]
    metrics_addr: SocketAddr,

    #[arg(long, env = "PUBLISHER_URL", default_value = publisher::DEFAULT_URL)]
    publisher_url: String,

    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 20)]
    fetch_timeout_secs: u64,

    #[arg(long, env = "ACCEPT_INVALID_CERTS")]
    accept_invalid_certs: bool,

    #[arg(long, env = "TELEGRAM_TOKEN", hide_env_values = true)]
    telegram_token: Option<String>,

    #[arg(long, env = "TELEGRAM_CHAT_ID", allow_hyphen_values = true)]
    telegram_chat_id: Option<i64>,

    /// Operating timezone as minutes east of UTC.
    #[arg(long, env = "UTC_OFFSET_MINUTES", default_value_t = DEFAULT_UTC_OFFSET_MINUTES, allow_hyphen_values = true)]
    utc_offset_minutes: i32,

    #[arg(long, env = "PREVENTIVE_START", default_value = "08:00", value_parser = parse_clock_time)]
    preventive_start: NaiveTime,

    #[arg(long, env = "INTENSIVE_START", default_value = "15:00", value_parser = parse_clock_time)]
    intensive_start: NaiveTime,

    #[arg(long, env = "INTENSIVE_END", default_value = "20:00", value_parser = parse_clock_time)]
    intensive_end: NaiveTime,

    #[arg(long, env = "OFF_HOURS_MINUTES", default_value_t = 30)]
    off_hours_minutes: u64,

    #[arg(long, env = "PREVENTIVE_MINUTES", default_value_t = 120)]
    preventive_minutes: u64,

    #[arg(long, env = "INTENSIVE_MINUTES", default_value_t = 5)]
    intensive_minutes: u64,

    #[arg(long, env = "EARLY_FOUND_MINUTES", default_value_t = 30)]
    early_found_minutes: u64,

    #[arg(long, env = "FAILURE_COOLDOWN_MINUTES", default_value_t = 60)]
    failure_cooldown_minutes: u64,
}

fn parse_clock_time(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|err| format!("expected HH:MM, got `{value}`: {err}"))
}

fn schedule_config(args: &Args) -> anyhow::Result<ScheduleConfig> {
    let minutes = |n: u64| Duration::from_secs(n * 60);
    let config = ScheduleConfig {
        utc_offset: utc_offset_from_minutes(args.utc_offset_minutes)?,
        preventive_start: args.preventive_start,
        intensive_start: args.intensive_start,
        intensive_end: args.intensive_end,
        off_hours_interval: minutes(args.off_hours_minutes),
        preventive_interval: minutes(args.preventive_minutes),
        intensive_interval: minutes(args.intensive_minutes),
        early_found_interval: minutes(args.early_found_minutes),
        failure_cooldown: minutes(args.failure_cooldown_minutes),
        ..ScheduleConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn build_notifier(args: &Args) -> anyhow::Result<Arc<dyn Notifier>> {
    match (&args.telegram_token, args.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            let notifier = TelegramNotifier::new(TelegramConfig::new(token.clone(), chat_id))?;
            Ok(Arc::new(notifier))
        }
        (Some(_), None) => bail!("TELEGRAM_TOKEN is set but TELEGRAM_CHAT_ID is missing"),
        (None, _) => {
            warn!("no telegram token configured; notifications go to the log only");
            Ok(Arc::new(LogNotifier))
        }
    }
}

fn log_startup(args: &Args, config: &ScheduleConfig, run_id: &str) {
    info!(path = %args.sqlite_path, "sqlite path configured");
    info!(path = %args.cache_path.display(), "local cache path configured");
    info!(socket = %args.admin_socket, "admin socket bind planned");
    info!(addr = %args.metrics_addr, "metrics bind planned");
    info!(url = %args.publisher_url, "publisher configured");
    info!(
        utc_offset = %config.utc_offset,
        preventive_start = %config.preventive_start,
        intensive_start = %config.intensive_start,
        intensive_end = %config.intensive_end,
        "polling windows configured"
    );
    info!(%run_id, "run initialized");
}

fn admin_status(run_id: &str, snapshot: &StatusSnapshot) -> AdminStatus {
    AdminStatus {
        run_id: run_id.to_string(),
        phase: snapshot.phase.clone(),
        found_today: snapshot.found_today,
        found_early: snapshot.found_early,
        last_date_of_record: snapshot.last_date_of_record.clone(),
        last_primary: snapshot.last_primary.clone(),
        next_wake_at: snapshot.next_wake_at.map(|at| at.to_rfc3339()),
        pending_appends: snapshot.pending_appends,
    }
}

fn handle_admin(
    run_id: &str,
    status: &watch::Receiver<StatusSnapshot>,
    polls: &mpsc::Sender<PollRequest>,
    req: AdminRequest,
) -> AdminResponse {
    match req {
        AdminRequest::Status => AdminResponse::Status(admin_status(run_id, &status.borrow())),
        AdminRequest::PollNow { note } => match polls.try_send(PollRequest { note }) {
            Ok(()) => AdminResponse::Ack,
            Err(mpsc::error::TrySendError::Full(_)) => {
                AdminResponse::Error("a poll request is already queued".into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                AdminResponse::Error("scheduler is not running".into())
            }
        },
    }
}

fn sqlite_file_part(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("sqlite://")?;
    Some(rest.split_once('?').map(|(path, _)| path).unwrap_or(rest))
}

fn ensure_sqlite_parent_dir(path: &str) -> anyhow::Result<()> {
    if let Some(file) = sqlite_file_part(path) {
        if let Some(parent) = PathBuf::from(file).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

fn validate_sqlite_path(path: &str) -> anyhow::Result<()> {
    if path.starts_with("sqlite::memory:") {
        return Ok(());
    }
    match sqlite_file_part(path) {
        None => bail!("sqlite path must start with `sqlite://` or use `sqlite::memory:`"),
        Some("") => bail!("sqlite path is missing a filesystem component after `sqlite://`"),
        Some(_) => Ok(()),
    }
}

/// Builds the store and records the run. Only a malformed URL is fatal; an
/// unreachable database is logged and retried by every later store call.
async fn open_store(sqlite_path: &str, run_id: &str) -> anyhow::Result<Store> {
    validate_sqlite_path(sqlite_path)?;
    if let Err(err) = ensure_sqlite_parent_dir(sqlite_path) {
        warn!(error = ?err, path = %sqlite_path, "cannot create sqlite parent directory");
    }
    let store = Store::connect_lazy(sqlite_path)?;
    match store.ensure_schema().await {
        Ok(()) => info!(path = %sqlite_path, "sqlite initialized"),
        Err(err) => {
            warn!(error = %err, path = %sqlite_path, "sqlite unavailable at boot; continuing on the local cache");
            return Ok(store);
        }
    }
    if let Err(err) = store.insert_run(run_id, None).await {
        warn!(error = ?err, "failed to record run");
    }
    match store.reading_count().await {
        Ok(count) => info!(count, "readings on record"),
        Err(err) => warn!(error = ?err, "failed to count readings"),
    }
    Ok(store)
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = ?err, "SIGTERM handler unavailable; waiting for ctrl-c only"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "ctrl-c handler failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = schedule_config(&args)?;
    info!(
        sqlite = %args.sqlite_path,
        socket = %args.admin_socket,
        "booting ratewatchd"
    );

    let run_id = Uuid::new_v4().to_string();
    log_startup(&args, &config, &run_id);
    let store = open_store(&args.sqlite_path, &run_id).await?;

    let metrics = MetricsHandle::new();
    let scheduler_metrics = metrics.scheduler_metrics()?;
    let metrics_addr = args.metrics_addr;
    task::spawn(async move {
        if let Err(err) = metrics.serve(metrics_addr).await {
            tracing::error!(error = ?err, "metrics server error");
        }
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    task::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
    let (poll_tx, poll_rx) = mpsc::channel(1);
    let run_id_clone = run_id.clone();
    let socket_path = args.admin_socket.clone();
    let admin_cancel = cancel.clone();
    let admin_task = task::spawn(async move {
        let handler = move |req: AdminRequest| -> anyhow::Result<AdminResponse> {
            Ok(handle_admin(&run_id_clone, &status_rx, &poll_tx, req))
        };
        if let Err(err) = run_server(&socket_path, admin_cancel, handler).await {
            tracing::error!(error = ?err, "admin ipc server failed");
        }
    });

    let fetcher = PublisherFetcher::new(FetcherConfig {
        url: args.publisher_url.clone(),
        timeout: Duration::from_secs(args.fetch_timeout_secs),
        accept_invalid_certs: args.accept_invalid_certs,
    })?;
    let scheduler = Scheduler::new(
        config,
        Collaborators {
            fetcher: Arc::new(fetcher),
            store: Arc::new(store.clone()),
            cache: Arc::new(LocalCache::new(&args.cache_path)),
            notifier: build_notifier(&args)?,
            clock: Arc::new(SystemClock),
        },
        scheduler_metrics,
    );

    if let Err(err) = store
        .log_incident(&run_id, "info", "ready", "ratewatchd booted and ready")
        .await
    {
        warn!(error = ?err, "failed to record ready incident");
    }
    info!(run_id = %run_id, "started");

    let final_state = scheduler.run(cancel, poll_rx, status_tx).await;

    if !final_state.pending_appends.is_empty() {
        warn!(
            pending = final_state.pending_appends.len(),
            "stopping with readings that never reached the store; the local cache holds the latest"
        );
    }
    if let Err(err) = admin_task.await {
        warn!(error = ?err, "admin ipc task did not finish cleanly");
    }
    if let Err(err) = store
        .log_incident(&run_id, "info", "stopped", "ratewatchd stopped")
        .await
    {
        warn!(error = ?err, "failed to record stop incident");
    }
    info!(run_id = %run_id, "stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct VecWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for VecWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for VecWriter {
        type Writer = VecWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "ratewatchd",
            "--sqlite-path",
            "sqlite:///tmp/test.db",
            "--admin-socket",
            "/tmp/test.sock",
            "--metrics-addr",
            "127.0.0.1:9000",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn startup_logs_include_configuration() {
        let args = args(&["--telegram-token", "123:secret", "--telegram-chat-id", "42"]);
        let config = schedule_config(&args).expect("default schedule");
        let run_id = Uuid::nil().to_string();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = VecWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(writer)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log_startup(&args, &config, &run_id);
        });

        let output =
            String::from_utf8(buffer.lock().unwrap().clone()).expect("log output should be utf8");
        assert!(output.contains("sqlite path configured"));
        assert!(output.contains("admin socket bind planned"));
        assert!(output.contains("metrics bind planned"));
        assert!(output.contains("polling windows configured"));
        assert!(output.contains("run initialized"));
        assert!(output.contains(&args.sqlite_path));
        assert!(output.contains(&args.admin_socket));
        assert!(output.contains(&args.metrics_addr.to_string()));
        assert!(output.contains(&run_id));
        assert!(!output.contains("secret"));
    }

    #[test]
    fn schedule_flags_override_defaults() {
        let args = args(&[
            "--utc-offset-minutes",
            "-300",
            "--intensive-start",
            "16:30",
            "--intensive-minutes",
            "3",
        ]);
        let config = schedule_config(&args).expect("valid schedule");
        assert_eq!(config.utc_offset.local_minus_utc(), -300 * 60);
        assert_eq!(
            config.intensive_start,
            NaiveTime::from_hms_opt(16, 30, 0).expect("time")
        );
        assert_eq!(config.intensive_interval, Duration::from_secs(180));
        assert_eq!(config.preventive_start, NaiveTime::from_hms_opt(8, 0, 0).expect("time"));
    }

    #[test]
    fn misordered_windows_are_rejected() {
        let args = args(&["--intensive-end", "07:00"]);
        assert!(schedule_config(&args).is_err());
    }

    #[test]
    fn clock_times_must_be_hours_and_minutes() {
        assert!(parse_clock_time("07:30").is_ok());
        assert!(parse_clock_time("7pm").is_err());
        assert!(parse_clock_time("25:00").is_err());
    }

    #[test]
    fn telegram_token_requires_chat_id() {
        let args = args(&["--telegram-token", "123:secret"]);
        assert!(build_notifier(&args).is_err());
        let args = args_without_telegram();
        assert!(build_notifier(&args).is_ok());
    }

    fn args_without_telegram() -> Args {
        args(&[])
    }

    #[test]
    fn admin_status_mirrors_snapshot() {
        let snapshot = StatusSnapshot {
            phase: "rested".into(),
            found_today: true,
            found_early: false,
            last_date_of_record: Some("Martes, 13 Enero 2026".into()),
            last_primary: Some("50.25".into()),
            next_wake_at: Utc.with_ymd_and_hms(2026, 1, 13, 12, 0, 0).single(),
            pending_appends: 1,
        };
        let status = admin_status("run-1", &snapshot);
        assert_eq!(status.run_id, "run-1");
        assert_eq!(status.phase, "rested");
        assert!(status.found_today);
        assert_eq!(status.last_primary.as_deref(), Some("50.25"));
        assert_eq!(
            status.next_wake_at.as_deref(),
            Some("2026-01-13T12:00:00+00:00")
        );
        assert_eq!(status.pending_appends, 1);
    }

    #[test]
    fn poll_requests_are_queued_once() {
        let (_status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let (poll_tx, mut poll_rx) = mpsc::channel(1);

        let first = handle_admin(
            "run-1",
            &status_rx,
            &poll_tx,
            AdminRequest::PollNow {
                note: Some("ping".into()),
            },
        );
        let second = handle_admin(
            "run-1",
            &status_rx,
            &poll_tx,
            AdminRequest::PollNow { note: None },
        );
        assert!(matches!(first, AdminResponse::Ack));
        assert!(matches!(second, AdminResponse::Error(_)));
        let queued = poll_rx.try_recv().expect("queued request");
        assert_eq!(queued.note.as_deref(), Some("ping"));

        drop(poll_rx);
        let closed = handle_admin("run-1", &status_rx, &poll_tx, AdminRequest::PollNow { note: None });
        assert!(matches!(closed, AdminResponse::Error(_)));
    }

    #[test]
    fn validates_memory_and_file_urls() {
        validate_sqlite_path("sqlite::memory:?cache=shared").expect("memory dsn should validate");
        validate_sqlite_path("sqlite://ratewatch.db").expect("relative file url should validate");
        validate_sqlite_path("sqlite:///var/lib/ratewatch/rates.db?mode=rwc")
            .expect("absolute file url should validate");
    }

    #[test]
    fn rejects_missing_or_invalid_urls() {
        let err = validate_sqlite_path("rates.db").expect_err("should reject plain filename");
        assert!(err
            .to_string()
            .contains("must start with `sqlite://` or use `sqlite::memory:`"));

        let err = validate_sqlite_path("sqlite://").expect_err("should reject empty path");
        assert!(err
            .to_string()
            .contains("missing a filesystem component after `sqlite://`"));
    }

    #[tokio::test]
    async fn unreachable_database_does_not_stop_boot() {
        let dir = std::env::temp_dir().join(format!("ratewatchd_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("temp dir");
        let blocker = dir.join("blocker");
        fs::write(&blocker, b"not a directory").expect("blocker file");
        let url = format!("sqlite://{}", blocker.join("rates.db").display());

        let store = open_store(&url, "run-1").await.expect("boot continues");
        assert!(reading::ReadingStore::latest(&store).await.is_err());

        let err = open_store("rates.db", "run-1").await;
        assert!(err.is_err());
        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[tokio::test]
    async fn reachable_database_records_the_run() {
        let dir = std::env::temp_dir().join(format!("ratewatchd_{}", Uuid::new_v4()));
        let url = format!("sqlite://{}", dir.join("data").join("rates.db").display());

        let store = open_store(&url, "run-1").await.expect("store");
        assert_eq!(store.reading_count().await.expect("count"), 0);
        assert!(dir.join("data").join("rates.db").exists());
        fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[test]
    fn creates_parent_directory_for_sqlite_url() {
        let dir = std::env::temp_dir().join(format!("ratewatchd_{}", Uuid::new_v4()));
        let db = dir.join("data").join("rates.db");
        let url = format!("sqlite://{}?mode=rwc", db.display());

        ensure_sqlite_parent_dir(&url).expect("parent dir creation should succeed");
        assert!(dir.join("data").is_dir());

        ensure_sqlite_parent_dir("sqlite::memory:").expect("memory urls are skipped");
        fs::remove_dir_all(&dir).expect("cleanup");
    }
}
