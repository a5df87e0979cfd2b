use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::{Config, ListenerConfig, Verdict};
use bulwark_daemon::{Client, Daemon, DrainStatus, Endpoint, ReloadOutcome, StartupError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const SIGNATURE_TEXT: &str = "BULWARK-TEST-SIGNATURE";
const OTHER_TEXT: &str = "BULWARK-OTHER-SIGNATURE";
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

fn ndb_line(name: &str, text: &str) -> String {
    format!("{name}:0:*:{}\n", hex::encode(text))
}

fn write_db(dir: &Path, lines: &[String]) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("main.ndb"), lines.concat()).unwrap();
}

fn test_config(db: &Path) -> Config {
    Config {
        database_directory: db.to_path_buf(),
        listeners: vec![ListenerConfig::tcp("127.0.0.1:0")],
        self_check_secs: 0,
        ..Config::default()
    }
}

/// Database with one signature matching `SIGNATURE_TEXT`.
fn signature_db() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_db(dir.path(), &[ndb_line("Test.Sig", SIGNATURE_TEXT)]);
    dir
}

async fn start(config: Config) -> (Daemon, SocketAddr) {
    let daemon = Daemon::start(Arc::new(config)).await.unwrap();
    let addr = daemon.tcp_addrs()[0];
    (daemon, addr)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Raw protocol connection for byte-exact tests.
struct Conn {
    stream: BufReader<TcpStream>,
    delimiter: u8,
}

impl Conn {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream: BufReader::new(stream),
            delimiter: b'\n',
        }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.unwrap();
    }

    async fn command(&mut self, command: &str) {
        let wire = if self.delimiter == b'\0' {
            format!("z{command}\0")
        } else {
            format!("n{command}\n")
        };
        self.send(wire.as_bytes()).await;
    }

    async fn chunk(&mut self, data: &[u8]) {
        let len = u32::try_from(data.len()).unwrap();
        self.send(&len.to_be_bytes()).await;
        self.send(data).await;
    }

    /// Next reply, or `None` once the server closed the connection.
    async fn reply(&mut self) -> Option<String> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(REPLY_TIMEOUT, self.stream.read_until(self.delimiter, &mut buf))
            .await
            .expect("reply timed out");
        match read {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                if buf.last() == Some(&self.delimiter) {
                    buf.pop();
                }
                Some(String::from_utf8(buf).unwrap())
            }
        }
    }

    async fn request(&mut self, command: &str) -> String {
        self.command(command).await;
        self.reply().await.expect("connection closed")
    }

    async fn assert_closed(&mut self) {
        assert_eq!(self.reply().await, None);
    }
}

fn client(addr: SocketAddr) -> Client {
    Client::new(Endpoint::Tcp(addr.to_string()), REPLY_TIMEOUT)
}

// ── basic commands ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_and_version_keep_connection_open() {
    let db = signature_db();
    let (daemon, addr) = start(test_config(db.path())).await;

    let mut conn = Conn::open(addr).await;
    assert_eq!(conn.request("PING").await, "PONG");

    let version = conn.request("VERSION").await;
    let build_id = daemon.handle().current_engine().build_id().to_string();
    assert_eq!(version, format!("{build_id} 1"));

    assert_eq!(conn.request("PING").await, "PONG");
    daemon.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_reports_infected_then_closes() {
    let db = signature_db();
    let samples = tempfile::tempdir().unwrap();
    let infected = samples.path().join("infected.txt");
    let clean = samples.path().join("clean.txt");
    std::fs::write(&infected, format!("header {SIGNATURE_TEXT} trailer")).unwrap();
    std::fs::write(&clean, "nothing here").unwrap();

    let (_daemon, addr) = start(test_config(db.path())).await;

    let mut conn = Conn::open(addr).await;
    let reply = conn.request(&format!("SCAN {}", infected.display())).await;
    assert_eq!(reply, format!("{}: Test.Sig FOUND", infected.display()));
    conn.assert_closed().await;

    let mut conn = Conn::open(addr).await;
    let reply = conn.request(&format!("SCAN {}", clean.display())).await;
    assert_eq!(reply, format!("{}: OK", clean.display()));
    conn.assert_closed().await;

    let missing = samples.path().join("missing.txt");
    let replies = tokio::task::spawn_blocking(move || client(addr).scan(&missing))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].verdict,
        Verdict::Error("No such file or directory".into())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_scans_all_find_signature() {
    const CLIENTS: usize = 8;
    let db = signature_db();
    let samples = tempfile::tempdir().unwrap();
    let infected = samples.path().join("infected.bin");
    std::fs::write(&infected, SIGNATURE_TEXT).unwrap();

    let config = Config {
        max_threads: CLIENTS,
        ..test_config(db.path())
    };
    let (_daemon, addr) = start(config).await;

    let scans: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let path = infected.clone();
            tokio::task::spawn_blocking(move || client(addr).scan(&path))
        })
        .collect();
    for scan in scans {
        let replies = scan.await.unwrap().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].verdict, Verdict::Infected("Test.Sig".into()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_scans() {
    let db = signature_db();
    let samples = tempfile::tempdir().unwrap();
    std::fs::write(samples.path().join("a.txt"), SIGNATURE_TEXT).unwrap();
    std::fs::write(samples.path().join("b.txt"), "clean").unwrap();
    std::fs::write(samples.path().join("c.txt"), SIGNATURE_TEXT).unwrap();
    let (_daemon, addr) = start(test_config(db.path())).await;

    let expected: Vec<(PathBuf, Verdict)> = vec![
        (samples.path().join("a.txt"), Verdict::Infected("Test.Sig".into())),
        (samples.path().join("b.txt"), Verdict::Clean),
        (samples.path().join("c.txt"), Verdict::Infected("Test.Sig".into())),
    ];
    let as_pairs = |replies: Vec<bulwark_daemon::ScanReply>| -> Vec<(PathBuf, Verdict)> {
        replies
            .into_iter()
            .map(|r| (PathBuf::from(r.target), r.verdict))
            .collect()
    };

    let dir = samples.path().to_path_buf();
    let cont = tokio::task::spawn_blocking(move || client(addr).contscan(&dir))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(as_pairs(cont), expected);

    let dir = samples.path().to_path_buf();
    let multi = tokio::task::spawn_blocking(move || client(addr).multiscan(&dir))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(as_pairs(multi), expected);

    // plain SCAN stops at the first infection
    let dir = samples.path().to_path_buf();
    let single = tokio::task::spawn_blocking(move || client(addr).scan(&dir))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(as_pairs(single), expected[..1].to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_directory_and_relative_path() {
    let db = signature_db();
    let empty = tempfile::tempdir().unwrap();
    let (_daemon, addr) = start(test_config(db.path())).await;

    let mut conn = Conn::open(addr).await;
    let reply = conn.request(&format!("CONTSCAN {}", empty.path().display())).await;
    assert_eq!(reply, format!("{}: OK", empty.path().display()));

    let mut conn = Conn::open(addr).await;
    let reply = conn.request("SCAN relative/file.txt").await;
    assert_eq!(reply, "relative/file.txt: Path must be absolute ERROR");
    conn.assert_closed().await;
}

// ── INSTREAM ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instream_verdicts() {
    let db = signature_db();
    let (_daemon, addr) = start(test_config(db.path())).await;

    // signature split across a chunk boundary
    let (head, tail) = SIGNATURE_TEXT.split_at(7);
    let mut conn = Conn::open(addr).await;
    conn.command("INSTREAM").await;
    conn.chunk(format!("prefix {head}").as_bytes()).await;
    conn.chunk(format!("{tail} suffix").as_bytes()).await;
    conn.chunk(b"").await;
    assert_eq!(conn.reply().await.unwrap(), "stream: Test.Sig FOUND");
    conn.assert_closed().await;

    let reply = tokio::task::spawn_blocking(move || client(addr).instream(&b"harmless bytes"[..]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.target, "stream");
    assert_eq!(reply.verdict, Verdict::Clean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instream_empty_stream_is_clean() {
    let db = signature_db();
    let (_daemon, addr) = start(test_config(db.path())).await;

    let mut conn = Conn::open(addr).await;
    conn.command("INSTREAM").await;
    conn.chunk(b"").await;
    assert_eq!(conn.reply().await.unwrap(), "stream: OK");
    conn.assert_closed().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instream_oversized_chunk_rejected_from_header() {
    let db = signature_db();
    let config = Config {
        stream_max_length: 16,
        ..test_config(db.path())
    };
    let (_daemon, addr) = start(config).await;

    let mut conn = Conn::open(addr).await;
    conn.command("INSTREAM").await;
    // header only: the declared payload is never sent
    conn.send(&1_000_000u32.to_be_bytes()).await;
    assert_eq!(
        conn.reply().await.unwrap(),
        "INSTREAM size limit exceeded. ERROR"
    );
    conn.assert_closed().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_reports_stream_limit_as_error_verdict() {
    let db = signature_db();
    let config = Config {
        stream_max_length: 1024,
        ..test_config(db.path())
    };
    let (_daemon, addr) = start(config).await;

    let payload = vec![b'a'; 4 * 1024 * 1024];
    let reply = tokio::task::spawn_blocking(move || client(addr).instream(&payload[..]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.target, "stream");
    assert_eq!(
        reply.verdict,
        Verdict::Error("INSTREAM size limit exceeded.".into())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_stream_times_out() {
    let db = signature_db();
    let config = Config {
        read_timeout_secs: 1,
        ..test_config(db.path())
    };
    let (_daemon, addr) = start(config).await;

    let mut conn = Conn::open(addr).await;
    conn.command("INSTREAM").await;
    conn.send(&10u32.to_be_bytes()).await;
    conn.send(b"abc").await;
    assert_eq!(conn.reply().await.unwrap(), "Stream read timeout ERROR");
    conn.assert_closed().await;
}

// ── protocol robustness ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_command_closes_only_that_connection() {
    let db = signature_db();
    let (_daemon, addr) = start(test_config(db.path())).await;

    let mut bystander = Conn::open(addr).await;
    assert_eq!(bystander.request("PING").await, "PONG");

    let mut offender = Conn::open(addr).await;
    assert_eq!(offender.request("FOO").await, "UNKNOWN COMMAND");
    offender.assert_closed().await;

    assert_eq!(bystander.request("PING").await, "PONG");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_with_nul_delimiter() {
    let db = signature_db();
    let (_daemon, addr) = start(test_config(db.path())).await;

    let mut conn = Conn::open(addr).await;
    conn.delimiter = b'\0';
    conn.command("SESSION").await;

    for _ in 0..2 {
        conn.command("INSTREAM").await;
        conn.chunk(SIGNATURE_TEXT.as_bytes()).await;
        conn.chunk(b"").await;
        assert_eq!(conn.reply().await.unwrap(), "stream: Test.Sig FOUND");
    }
    assert_eq!(conn.request("PING").await, "PONG");

    conn.command("END").await;
    conn.assert_closed().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_block() {
    let db = signature_db();
    let config = Config {
        max_threads: 3,
        ..test_config(db.path())
    };
    let (_daemon, addr) = start(config).await;

    let mut conn = Conn::open(addr).await;
    conn.command("STATS").await;
    let mut lines = Vec::new();
    loop {
        let line = conn.reply().await.unwrap();
        if line == "END" {
            break;
        }
        lines.push(line);
    }
    assert!(lines.contains(&"THREADS: live 1 max 3".to_string()), "{lines:?}");
    assert!(lines.contains(&"ENGINES: live 1".to_string()), "{lines:?}");
    assert!(lines.iter().any(|l| l.starts_with("DATABASE: bulwark-")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_connection_is_closed() {
    let db = signature_db();
    let config = Config {
        idle_timeout_secs: 1,
        ..test_config(db.path())
    };
    let (daemon, addr) = start(config).await;

    let mut conn = Conn::open(addr).await;
    assert_eq!(conn.request("PING").await, "PONG");
    conn.assert_closed().await;

    let handle = daemon.handle();
    eventually("slot release", || handle.active_workers() == 0).await;
}

// ── admission ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturated_daemon_answers_busy() {
    let db = signature_db();
    let config = Config {
        max_threads: 1,
        max_queue: 0,
        ..test_config(db.path())
    };
    let (daemon, addr) = start(config).await;

    let mut holder = Conn::open(addr).await;
    assert_eq!(holder.request("PING").await, "PONG");

    let mut rejected = Conn::open(addr).await;
    assert_eq!(rejected.reply().await.unwrap(), "Server busy ERROR");
    rejected.assert_closed().await;

    assert_eq!(daemon.handle().active_workers(), 1);
    assert_eq!(holder.request("PING").await, "PONG");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_connection_is_served_when_slot_frees() {
    let db = signature_db();
    let config = Config {
        max_threads: 1,
        max_queue: 1,
        queue_timeout_secs: 10,
        ..test_config(db.path())
    };
    let (daemon, addr) = start(config).await;
    let handle = daemon.handle();

    let mut holder = Conn::open(addr).await;
    assert_eq!(holder.request("PING").await, "PONG");

    let mut waiting = Conn::open(addr).await;
    waiting.command("PING").await;
    eventually("queued connection", || handle.queued() == 1).await;
    assert_eq!(handle.active_workers(), 1);

    holder.command("END").await;
    holder.assert_closed().await;

    assert_eq!(waiting.reply().await.unwrap(), "PONG");
    assert_eq!(handle.queued(), 0);
}

// ── reload ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_mid_stream_keeps_captured_engine() {
    let db = signature_db();
    let (daemon, addr) = start(test_config(db.path())).await;
    let handle = daemon.handle();

    // bound to v1 before the reload
    let mut inflight = Conn::open(addr).await;
    assert_eq!(inflight.request("PING").await, "PONG");
    inflight.command("INSTREAM").await;
    inflight.chunk(b"some leading bytes ").await;

    write_db(
        db.path(),
        &[
            ndb_line("Other.Sig", OTHER_TEXT),
            ndb_line("Third.Sig", "BULWARK-THIRD"),
        ],
    );
    let outcome = handle.reload().await.unwrap();
    assert!(matches!(
        outcome,
        ReloadOutcome::Published { signature_count: 2, .. }
    ));
    assert_eq!(handle.live_engines(), 2);

    let mut fresh = Conn::open(addr).await;
    let version = fresh.request("VERSION").await;
    assert!(version.ends_with(" 2"), "{version}");

    inflight.chunk(SIGNATURE_TEXT.as_bytes()).await;
    inflight.chunk(b"").await;
    assert_eq!(inflight.reply().await.unwrap(), "stream: Test.Sig FOUND");
    inflight.assert_closed().await;

    eventually("v1 retirement", || handle.live_engines() == 1).await;

    // a broken database leaves v2 in service
    std::fs::write(db.path().join("main.ndb"), "not a signature\n").unwrap();
    assert!(handle.reload().await.is_err());
    let mut after = Conn::open(addr).await;
    assert_eq!(after.request("VERSION").await, version);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_command_is_acknowledged() {
    let db = signature_db();
    let (daemon, addr) = start(test_config(db.path())).await;
    let handle = daemon.handle();

    write_db(
        db.path(),
        &[
            ndb_line("Test.Sig", SIGNATURE_TEXT),
            ndb_line("Other.Sig", OTHER_TEXT),
        ],
    );
    let mut conn = Conn::open(addr).await;
    assert_eq!(conn.request("RELOAD").await, "RELOAD");
    assert_eq!(conn.request("PING").await, "PONG");

    eventually("background reload", || {
        handle.current_engine().signature_count() == 2
    })
    .await;
}

// ── shutdown ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_shutdown_is_clean_and_stops_listening() {
    let db = signature_db();
    let (daemon, addr) = start(test_config(db.path())).await;

    let mut idle = Conn::open(addr).await;
    assert_eq!(idle.request("PING").await, "PONG");

    assert_eq!(daemon.shutdown(Duration::from_secs(5)).await, DrainStatus::Clean);
    idle.assert_closed().await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_waits_for_inflight_stream() {
    let db = signature_db();
    let (daemon, addr) = start(test_config(db.path())).await;
    let handle = daemon.handle();

    let mut inflight = Conn::open(addr).await;
    assert_eq!(inflight.request("PING").await, "PONG");
    inflight.command("INSTREAM").await;
    inflight.chunk(b"partial ").await;
    // let the worker leave AwaitingCommand before the stop request
    tokio::time::sleep(Duration::from_millis(100)).await;

    let shutdown = tokio::spawn(daemon.shutdown(Duration::from_secs(10)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.active_workers(), 1);

    inflight.chunk(SIGNATURE_TEXT.as_bytes()).await;
    inflight.chunk(b"").await;
    assert_eq!(inflight.reply().await.unwrap(), "stream: Test.Sig FOUND");
    inflight.assert_closed().await;

    assert_eq!(shutdown.await.unwrap(), DrainStatus::Clean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_worker_is_forced_closed() {
    let db = signature_db();
    let (daemon, addr) = start(test_config(db.path())).await;
    let handle = daemon.handle();

    let mut stalled = Conn::open(addr).await;
    assert_eq!(stalled.request("PING").await, "PONG");
    stalled.command("INSTREAM").await;
    stalled.send(&10u32.to_be_bytes()).await;
    stalled.send(b"abc").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = daemon.shutdown(Duration::from_millis(200)).await;
    assert_eq!(status, DrainStatus::Forced);
    stalled.assert_closed().await;
    assert_eq!(handle.active_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_command_ends_run() {
    let db = signature_db();
    let config = Config {
        drain_timeout_secs: 5,
        ..test_config(db.path())
    };
    let (daemon, addr) = start(config).await;
    let run = tokio::spawn(daemon.run());

    tokio::task::spawn_blocking(move || client(addr).shutdown())
        .await
        .unwrap()
        .unwrap();

    let status = tokio::time::timeout(REPLY_TIMEOUT, run)
        .await
        .expect("daemon did not stop")
        .unwrap();
    assert_eq!(status, DrainStatus::Clean);
}

// ── startup ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn startup_failures() {
    let missing = tempfile::tempdir().unwrap();
    let config = test_config(&missing.path().join("absent"));
    let Err(err) = Daemon::start(Arc::new(config)).await else {
        panic!("started without a database");
    };
    assert!(matches!(err, StartupError::Database(_)));

    let db = signature_db();
    let config = Config {
        listeners: Vec::new(),
        ..test_config(db.path())
    };
    let Err(err) = Daemon::start(Arc::new(config)).await else {
        panic!("started without listeners");
    };
    assert!(matches!(err, StartupError::NoListenersConfigured));

    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = Config {
        listeners: vec![ListenerConfig::tcp(taken.local_addr().unwrap().to_string())],
        ..test_config(db.path())
    };
    let Err(err) = Daemon::start(Arc::new(config)).await else {
        panic!("started on a port in use");
    };
    assert!(matches!(err, StartupError::NoListenerBound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[cfg(unix)]
async fn local_socket_transport() {
    use std::os::unix::fs::PermissionsExt;

    let db = signature_db();
    let run_dir = tempfile::tempdir().unwrap();
    let socket = run_dir.path().join("bulwark.sock");
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config(db.path());
    config.listeners = vec![
        // one failed bind is tolerated while another succeeds
        ListenerConfig::tcp(taken.local_addr().unwrap().to_string()),
        ListenerConfig {
            transport: bulwark_core::Transport::Local {
                path: socket.clone(),
                mode: 0o600,
            },
            backlog: 16,
        },
    ];
    let daemon = Daemon::start(Arc::new(config)).await.unwrap();
    assert!(daemon.tcp_addrs().is_empty());

    let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let local = Client::new(Endpoint::Local(socket.clone()), REPLY_TIMEOUT);
    let reply = tokio::task::spawn_blocking(move || {
        local.ping()?;
        local.instream(SIGNATURE_TEXT.as_bytes())
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.verdict, Verdict::Infected("Test.Sig".into()));

    assert_eq!(daemon.shutdown(Duration::from_secs(5)).await, DrainStatus::Clean);
    assert!(!socket.exists());
}
