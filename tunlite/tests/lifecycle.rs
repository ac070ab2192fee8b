//! Lifecycle scenarios against real proxy/relay processes and a pipe-backed
//! interface provider.

use std::io::Read;
use std::net::TcpListener as StdTcpListener;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::tempdir;
use tokio::net::TcpListener;

use tunlite::net::RoutingPlan;
use tunlite::process::is_process_alive;
use tunlite::{
    InterfaceHandle, InterfaceParams, InterfaceProvider, ProxyConfig, TunnelController,
    TunnelError, TunnelOptions, TunnelResult, TunnelState,
};

const PROXY_CONFIG: &str = r#"{"inbounds":[{"port":10808,"protocol":"socks"}]}"#;

// ============================================================================
// Pipe-backed interface
// ============================================================================

#[derive(Default)]
struct MockState {
    present: AtomicBool,
    closed: AtomicBool,
    established: AtomicBool,
    /// Read end of the last pipe; whatever the relay writes to its slot lands here.
    reader: Mutex<Option<OwnedFd>>,
}

struct MockProvider {
    state: Arc<MockState>,
    fail: bool,
}

impl MockProvider {
    fn new() -> (Arc<Self>, Arc<MockState>) {
        Self::build(false)
    }

    fn failing() -> (Arc<Self>, Arc<MockState>) {
        Self::build(true)
    }

    fn build(fail: bool) -> (Arc<Self>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let provider = Arc::new(Self {
            state: Arc::clone(&state),
            fail,
        });
        (provider, state)
    }
}

impl InterfaceProvider for MockProvider {
    fn establish(&self, _params: &InterfaceParams) -> TunnelResult<Box<dyn InterfaceHandle>> {
        if self.fail {
            return Err(TunnelError::InterfaceEstablishFailed(
                "mock: no permission to create TUN".into(),
            ));
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        *self.state.reader.lock() = Some(reader);
        self.state.present.store(true, Ordering::SeqCst);
        self.state.closed.store(false, Ordering::SeqCst);
        self.state.established.store(true, Ordering::SeqCst);

        Ok(Box::new(MockInterface {
            fd: Some(writer),
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug)]
struct MockInterface {
    fd: Option<OwnedFd>,
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockState")
            .field("present", &self.present.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl InterfaceHandle for MockInterface {
    fn name(&self) -> &str {
        "mock0"
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn raw_descriptor(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn routing(&self) -> Option<&RoutingPlan> {
        None
    }

    fn is_present(&self) -> bool {
        self.state.present.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> TunnelResult<()> {
        self.fd.take();
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_options(home: &Path) -> TunnelOptions {
    let mut options = TunnelOptions::with_home(home);
    options.proxy.program = PathBuf::from("/bin/sleep");
    options.proxy.args = vec!["30".into()];
    options.relay.program = PathBuf::from("/bin/sh");
    options.relay.args = vec!["-c".into(), "printf up >&3; exec sleep 30".into()];
    options.probe.timeout_ms = 3_000;
    options.grace_period_ms = 500;
    options.health_interval_ms = None;
    options
}

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Bind `port` after `delay` and hold it for the rest of the test.
fn listen_after(port: u16, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        loop {
            let _ = listener.accept().await;
        }
    })
}

async fn running_controller(
    home: &Path,
    options: TunnelOptions,
) -> (TunnelController, Arc<MockState>, u16, tokio::task::JoinHandle<()>) {
    let (provider, state) = MockProvider::new();
    let controller = TunnelController::with_interface_provider(options, provider).unwrap();
    let port = free_port();
    let listener = listen_after(port, Duration::ZERO);
    controller
        .start(ProxyConfig::new(PROXY_CONFIG), port)
        .await
        .unwrap();
    assert!(home.join("run").exists());
    (controller, state, port, listener)
}

async fn wait_for_state(controller: &TunnelController, state: TunnelState, within: Duration) -> bool {
    tokio::time::timeout(within, async {
        while controller.state() != state {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_start_reaches_running_when_listener_appears_late() {
    let home = tempdir().unwrap();
    let (provider, state) = MockProvider::new();
    let controller =
        TunnelController::with_interface_provider(test_options(home.path()), provider).unwrap();

    let port = free_port();
    let _listener = listen_after(port, Duration::from_millis(500));

    let started = Instant::now();
    controller
        .start(ProxyConfig::new(PROXY_CONFIG), port)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(450), "started too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1_500), "started too late: {:?}", elapsed);

    let status = controller.status();
    assert!(status.running);
    assert_eq!(status.last_error, None);

    let info = controller.info();
    assert_eq!(info.state, TunnelState::Running);
    assert_eq!(info.socks_port, Some(port));
    assert_eq!(info.interface.as_deref(), Some("mock0"));
    assert!(info.started_at.is_some());
    let metrics = info.start_metrics.unwrap();
    assert!(
        metrics.port_probe_ms.is_some_and(|ms| ms >= 400),
        "probe took {:?} ms",
        metrics.port_probe_ms
    );

    let proxy_pid = info.proxy_pid.unwrap();
    let relay_pid = info.relay_pid.unwrap();
    assert!(is_process_alive(proxy_pid));
    assert!(is_process_alive(relay_pid));

    let written = std::fs::read_to_string(home.path().join("run/proxy_config.json")).unwrap();
    assert_eq!(written, PROXY_CONFIG);
    let relay_doc = std::fs::read_to_string(home.path().join("run/relay_config.yml")).unwrap();
    assert!(relay_doc.contains(&format!("port: {}", port)));
    assert!(relay_doc.contains("fd: 3"));

    controller.stop().await.unwrap();

    assert_eq!(controller.state(), TunnelState::Idle);
    assert!(state.closed.load(Ordering::SeqCst));
    assert!(!is_process_alive(proxy_pid));
    assert!(!is_process_alive(relay_pid));
    assert!(!home.path().join("run/proxy_config.json").exists());
    assert!(!home.path().join("run/relay_config.yml").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_times_out_without_listener_and_kills_proxy() {
    let home = tempdir().unwrap();
    let pid_file = home.path().join("proxy.pid");

    let mut options = test_options(home.path());
    options.proxy.program = PathBuf::from("/bin/sh");
    options.proxy.args = vec![
        "-c".into(),
        format!("echo $$ > {}; exec sleep 30", pid_file.display()),
    ];
    options.probe.timeout_ms = 1_000;

    let (provider, state) = MockProvider::new();
    let controller = TunnelController::with_interface_provider(options, provider).unwrap();

    let port = free_port();
    let started = Instant::now();
    let err = controller
        .start(ProxyConfig::new(PROXY_CONFIG), port)
        .await
        .unwrap_err();

    assert!(
        matches!(err, TunnelError::PortTimeout { port: p, timeout_ms: 1_000 } if p == port),
        "unexpected error: {:?}",
        err
    );
    assert!(started.elapsed() < Duration::from_secs(4));

    let status = controller.status();
    assert!(!status.running);
    let last_error = status.last_error.unwrap();
    assert!(last_error.contains("timeout"), "last_error: {}", last_error);
    assert!(last_error.contains(&port.to_string()), "last_error: {}", last_error);

    assert_eq!(controller.state(), TunnelState::Idle);
    assert!(!state.established.load(Ordering::SeqCst));

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!is_process_alive(pid), "proxy {} survived a failed start", pid);
    assert!(!home.path().join("run/proxy_config.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interface_failure_releases_proxy() {
    let home = tempdir().unwrap();
    let pid_file = home.path().join("proxy.pid");

    let mut options = test_options(home.path());
    options.proxy.program = PathBuf::from("/bin/sh");
    options.proxy.args = vec![
        "-c".into(),
        format!("echo $$ > {}; exec sleep 30", pid_file.display()),
    ];

    let (provider, _state) = MockProvider::failing();
    let controller = TunnelController::with_interface_provider(options, provider).unwrap();

    let port = free_port();
    let _listener = listen_after(port, Duration::ZERO);
    let err = controller
        .start(ProxyConfig::new(PROXY_CONFIG), port)
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::InterfaceEstablishFailed(_)), "{:?}", err);
    let status = controller.status();
    assert!(!status.running);
    assert!(status.last_error.unwrap().contains("mock: no permission"));

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!is_process_alive(pid));
    assert!(!home.path().join("run/proxy_config.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_failure_closes_interface() {
    let home = tempdir().unwrap();
    let mut options = test_options(home.path());
    options.relay.program = PathBuf::from("/nonexistent/tunlite-relay");

    let (provider, state) = MockProvider::new();
    let controller = TunnelController::with_interface_provider(options, provider).unwrap();

    let port = free_port();
    let _listener = listen_after(port, Duration::ZERO);
    let err = controller
        .start(ProxyConfig::new(PROXY_CONFIG), port)
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::LaunchFailed(_)), "{:?}", err);
    assert!(state.established.load(Ordering::SeqCst));
    assert!(state.closed.load(Ordering::SeqCst));
    assert_eq!(controller.state(), TunnelState::Idle);
    assert!(!home.path().join("run/relay_config.yml").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_receives_descriptor_at_slot() {
    let home = tempdir().unwrap();
    let (controller, state, _port, _listener) =
        running_controller(home.path(), test_options(home.path())).await;

    let reader = state.reader.lock().take().unwrap();
    let received = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::from(reader);
            let mut buf = [0u8; 2];
            file.read_exact(&mut buf).map(|_| buf)
        }),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(&received, b"up");

    controller.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_while_running_is_rejected() {
    let home = tempdir().unwrap();
    let (controller, _state, port, _listener) =
        running_controller(home.path(), test_options(home.path())).await;

    let err = controller
        .start(ProxyConfig::new(PROXY_CONFIG), port)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyActive(TunnelState::Running)), "{:?}", err);
    assert!(controller.status().running);

    controller.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_config_is_rejected_without_state_change() {
    let home = tempdir().unwrap();
    let (provider, state) = MockProvider::new();
    let controller =
        TunnelController::with_interface_provider(test_options(home.path()), provider).unwrap();

    let err = controller
        .start(ProxyConfig::new("   \n"), free_port())
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::ConfigMissing));
    assert_eq!(controller.state(), TunnelState::Idle);
    assert!(controller.status().last_error.is_some());
    assert!(!state.established.load(Ordering::SeqCst));

    // Nothing prepared is the same as an empty config.
    let home2 = tempdir().unwrap();
    let (provider2, _) = MockProvider::new();
    let fresh =
        TunnelController::with_interface_provider(test_options(home2.path()), provider2).unwrap();
    let err = fresh.start_prepared().await.unwrap_err();
    assert!(matches!(err, TunnelError::ConfigMissing));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prepare_then_start_prepared() {
    let home = tempdir().unwrap();
    let (provider, _state) = MockProvider::new();
    let controller =
        TunnelController::with_interface_provider(test_options(home.path()), provider).unwrap();

    let port = free_port();
    let _listener = listen_after(port, Duration::ZERO);
    controller.prepare(ProxyConfig::new(PROXY_CONFIG), port);
    controller.start_prepared().await.unwrap();

    assert_eq!(controller.info().socks_port, Some(port));
    controller.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_is_idempotent() {
    let home = tempdir().unwrap();
    let (provider, _state) = MockProvider::new();
    let controller =
        TunnelController::with_interface_provider(test_options(home.path()), provider).unwrap();

    // From Idle.
    controller.stop().await.unwrap();
    controller.stop().await.unwrap();
    assert_eq!(controller.state(), TunnelState::Idle);

    let port = free_port();
    let _listener = listen_after(port, Duration::ZERO);
    controller
        .start(ProxyConfig::new(PROXY_CONFIG), port)
        .await
        .unwrap();
    let proxy_pid = controller.info().proxy_pid.unwrap();

    // Concurrent stops.
    let (a, b) = tokio::join!(controller.stop(), controller.stop());
    a.unwrap();
    b.unwrap();
    controller.stop().await.unwrap();

    let status = controller.status();
    assert!(!status.running);
    assert_eq!(status.last_error, None);
    assert!(!is_process_alive(proxy_pid));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_during_start_aborts() {
    let home = tempdir().unwrap();
    let mut options = test_options(home.path());
    options.probe.timeout_ms = 10_000;

    let (provider, state) = MockProvider::new();
    let controller = TunnelController::with_interface_provider(options, provider).unwrap();

    let port = free_port();
    let starter = controller.clone();
    let start = tokio::spawn(async move {
        starter.start(ProxyConfig::new(PROXY_CONFIG), port).await
    });

    assert!(wait_for_state(&controller, TunnelState::Starting, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stop_started = Instant::now();
    controller.stop().await.unwrap();
    assert!(stop_started.elapsed() < Duration::from_secs(3));

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::StartAborted), "{:?}", err);

    let info = controller.info();
    assert_eq!(info.state, TunnelState::Idle);
    assert_eq!(info.proxy_pid, None);
    assert_eq!(info.last_error, None);
    assert!(!state.established.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_stop_right_after_accept_waits_for_start_to_settle() {
    let home = tempdir().unwrap();
    let (provider, state) = MockProvider::new();
    let controller =
        TunnelController::with_interface_provider(test_options(home.path()), provider).unwrap();

    let port = free_port();
    let mut start = Box::pin(controller.start(ProxyConfig::new(PROXY_CONFIG), port));
    // A single poll accepts the start and spawns the sequence.
    assert!(tokio::time::timeout(Duration::ZERO, &mut start).await.is_err());
    assert_eq!(controller.state(), TunnelState::Starting);

    controller.stop().await.unwrap();

    let status = controller.status();
    assert_eq!(controller.state(), TunnelState::Idle);
    assert!(!status.running);
    assert_eq!(status.last_error, None);

    let err = start.await.unwrap_err();
    assert!(matches!(err, TunnelError::StartAborted), "{:?}", err);
    assert!(!state.established.load(Ordering::SeqCst));
    assert!(!home.path().join("run/proxy_config.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vanished_interface_revokes_session() {
    let home = tempdir().unwrap();
    let mut options = test_options(home.path());
    options.health_interval_ms = Some(100);

    let (controller, state, _port, _listener) = running_controller(home.path(), options).await;
    let relay_pid = controller.info().relay_pid.unwrap();

    state.present.store(false, Ordering::SeqCst);

    assert!(wait_for_state(&controller, TunnelState::Idle, Duration::from_secs(5)).await);
    assert!(state.closed.load(Ordering::SeqCst));
    assert_eq!(controller.status().last_error, None);
    assert!(!is_process_alive(relay_pid));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxy_exit_stops_session_with_error() {
    let home = tempdir().unwrap();
    let mut options = test_options(home.path());
    options.health_interval_ms = Some(100);
    options.proxy.args = vec!["1".into()];

    let (controller, state, _port, _listener) = running_controller(home.path(), options).await;

    assert!(wait_for_state(&controller, TunnelState::Idle, Duration::from_secs(5)).await);
    assert!(state.closed.load(Ordering::SeqCst));
    let last_error = controller.status().last_error.unwrap();
    assert!(last_error.contains("proxy process exited"), "last_error: {}", last_error);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stats_are_zero_when_not_running() {
    let home = tempdir().unwrap();
    let (provider, _state) = MockProvider::new();
    let controller =
        TunnelController::with_interface_provider(test_options(home.path()), provider).unwrap();

    let stats = controller.query_stats().await;
    assert_eq!(stats.upload, 0);
    assert_eq!(stats.download, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_controller_on_same_home_is_refused() {
    let home = tempdir().unwrap();
    let (provider, _) = MockProvider::new();
    let _first =
        TunnelController::with_interface_provider(test_options(home.path()), provider).unwrap();

    let (provider2, _) = MockProvider::new();
    let second = TunnelController::with_interface_provider(test_options(home.path()), provider2);
    assert!(matches!(second, Err(TunnelError::Storage(_))));
}
