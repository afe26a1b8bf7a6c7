//! End-to-end upgrades driving the compiled demo binary.

#![cfg(target_os = "linux")]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

const DEMO: &str = env!("CARGO_BIN_EXE_moult-demo");

/// A supervised demo running from a private copy of the binary.
struct Demo {
    dir: TempDir,
    bin: PathBuf,
    next: PathBuf,
    log: PathBuf,
    port: u16,
    supervisor: Child,
}

impl Demo {
    fn start(terminate_timeout: &str) -> Demo {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("app");
        fs::copy(DEMO, &bin).unwrap();
        let next = dir.path().join("next");
        let log = dir.path().join("supervisor.log");
        let port = free_port();

        let supervisor = Command::new(&bin)
            .arg("--listen")
            .arg(format!("127.0.0.1:{port}"))
            .arg("--watch")
            .arg(&next)
            .arg("--terminate-timeout")
            .arg(terminate_timeout)
            .env("RUST_LOG", "info")
            .env_remove("MOULT_IS_CHILD")
            .env_remove("MOULT_BIN_CHECK")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(fs::File::create(&log).unwrap())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        Demo {
            dir,
            bin,
            next,
            log,
            port,
            supervisor,
        }
    }

    fn supervisor_pid(&self) -> i32 {
        self.supervisor.id().expect("supervisor running") as i32
    }

    async fn greet(&self) -> std::io::Result<Greeting> {
        greet(self.port).await
    }

    /// Retry until a generation at least `generation` answers.
    async fn wait_for_generation(&self, generation: u64, within: Duration) -> Greeting {
        let deadline = Instant::now() + within;
        loop {
            if let Ok(greeting) = self.greet().await {
                if greeting.generation >= generation {
                    return greeting;
                }
            }
            assert!(
                Instant::now() < deadline,
                "generation {generation} never answered\n{}",
                self.log_contents()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Publish a new build where the watcher picks it up, in one rename.
    fn publish(&self, contents: &[u8]) {
        let staging = self.dir.path().join("next.partial");
        fs::write(&staging, contents).unwrap();
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).unwrap();
        fs::rename(&staging, &self.next).unwrap();
    }

    fn log_contents(&self) -> String {
        fs::read_to_string(&self.log).unwrap_or_default()
    }

    async fn wait_for_log(&self, needle: &str, within: Duration) {
        let deadline = Instant::now() + within;
        while !self.log_contents().contains(needle) {
            assert!(
                Instant::now() < deadline,
                "log never mentioned {needle:?}\n{}",
                self.log_contents()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for Demo {
    fn drop(&mut self) {
        // SIGINT is forwarded, so the child winds down on its own.
        if let Some(pid) = self.supervisor.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Greeting {
    generation: u64,
    pid: i32,
    binary: String,
}

impl Greeting {
    /// `hello from generation G (pid P, binary B)`
    fn parse(line: &str) -> Option<Greeting> {
        let rest = line.trim().strip_prefix("hello from generation ")?;
        let (generation, rest) = rest.split_once(" (pid ")?;
        let (pid, rest) = rest.split_once(", binary ")?;
        let binary = rest.strip_suffix(')')?;
        Some(Greeting {
            generation: generation.parse().ok()?,
            pid: pid.parse().ok()?,
            binary: binary.to_string(),
        })
    }
}

async fn greet(port: u16) -> std::io::Result<Greeting> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut line))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no greeting"))??;
    Greeting::parse(&line).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unexpected greeting {line:?}"))
    })
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Gone, or a zombie waiting for a parent that no longer cares.
fn process_gone(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

async fn wait_gone(pid: i32, within: Duration) -> Duration {
    let started = Instant::now();
    while !process_gone(pid) {
        assert!(started.elapsed() < within, "process {pid} still running");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    started.elapsed()
}

fn pids_in(path: &Path) -> Vec<i32> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upgrade_hands_over_without_dropping_connections() {
    let demo = Demo::start("5s");
    let first = demo.wait_for_generation(1, Duration::from_secs(10)).await;
    assert_eq!(first.generation, 1);

    let stop = Arc::new(AtomicBool::new(false));
    let client = tokio::spawn({
        let stop = Arc::clone(&stop);
        let port = demo.port;
        async move {
            let (mut served, mut failed) = (0, Vec::new());
            while !stop.load(Ordering::SeqCst) {
                match greet(port).await {
                    Ok(_) => served += 1,
                    Err(err) => failed.push(err.to_string()),
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            (served, failed)
        }
    });

    let mut upgraded = fs::read(&demo.bin).unwrap();
    upgraded.extend_from_slice(b"\0build-2");
    demo.publish(&upgraded);

    let second = demo.wait_for_generation(2, Duration::from_secs(30)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    stop.store(true, Ordering::SeqCst);
    let (served, failed) = client.await.unwrap();

    assert!(failed.is_empty(), "failed connections: {failed:?}");
    assert!(served > 0);
    assert_ne!(second.pid, first.pid);
    assert_ne!(second.binary, first.binary);
    assert_eq!(fs::read(&demo.bin).unwrap(), upgraded);

    wait_gone(first.pid, Duration::from_secs(10)).await;
}

#[tokio::test]
async fn broken_build_is_rejected() {
    let demo = Demo::start("5s");
    let first = demo.wait_for_generation(1, Duration::from_secs(10)).await;
    let original = fs::read(&demo.bin).unwrap();

    demo.publish(b"#!/bin/sh\necho broken >&2\nexit 3\n");
    demo.wait_for_log("sanity check failed", Duration::from_secs(30)).await;

    assert_eq!(fs::read(&demo.bin).unwrap(), original);
    let still = demo.greet().await.unwrap();
    assert_eq!(still, first);
}

#[tokio::test]
async fn child_ignoring_restart_is_killed_and_replaced() {
    let demo = Demo::start("2s");
    demo.wait_for_generation(1, Duration::from_secs(10)).await;

    // A build that passes the sanity check, records its pid, and then ignores
    // the restart signal for good.
    let pids = demo.dir.path().join("pids");
    let script = format!(
        "#!/bin/sh\n\
         if [ -n \"$MOULT_BIN_CHECK\" ]; then printf '%s' \"$MOULT_BIN_CHECK\"; exit 0; fi\n\
         echo $$ >> '{}'\n\
         trap '' USR2\n\
         exec sleep 60\n",
        pids.display()
    );
    demo.publish(script.as_bytes());

    let deadline = Instant::now() + Duration::from_secs(30);
    while pids_in(&pids).is_empty() {
        assert!(Instant::now() < deadline, "stubborn build never started\n{}", demo.log_contents());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let stubborn = pids_in(&pids)[0];

    unsafe {
        libc::kill(demo.supervisor_pid(), libc::SIGUSR2);
    }
    let took = wait_gone(stubborn, Duration::from_secs(10)).await;
    assert!(took >= Duration::from_millis(1500), "killed after {took:?}");
    assert!(took <= Duration::from_secs(4), "killed after {took:?}");

    let deadline = Instant::now() + Duration::from_secs(5);
    while pids_in(&pids).len() < 2 {
        assert!(Instant::now() < deadline, "no replacement after the kill");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!process_gone(pids_in(&pids)[1]));
}

#[tokio::test]
async fn child_exits_when_supervisor_dies() {
    let mut demo = Demo::start("5s");
    let greeting = demo.wait_for_generation(1, Duration::from_secs(10)).await;

    demo.supervisor.start_kill().unwrap();
    demo.supervisor.wait().await.unwrap();

    wait_gone(greeting.pid, Duration::from_secs(8)).await;
}

#[tokio::test]
async fn sanity_check_is_answered_before_settings_load() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(DEMO)
        .arg("--config")
        .arg(dir.path().join("gone-settings.toml"))
        .env("MOULT_BIN_CHECK", "tok123")
        .env("MOULT_DEMO_TERMINATE_TIMEOUT", "bogus")
        .env_remove("MOULT_IS_CHILD")
        .stdin(Stdio::null())
        .output()
        .await
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"tok123");
}
