//! End-to-end coverage: a real russh client talks through the proxy to an
//! in-process upstream SSH server that echoes stdin and reports exit status.

use std::sync::{Arc, Mutex as StdMutex};

use hopssh::config::parse_config;
use hopssh::context::AppContext;
use hopssh::metrics::collectors::FailureLabel;
use hopssh::metrics::MetricsRegistry;
use hopssh::server::{build_server_config, ProxyServer};

use russh::keys::{Algorithm, HashAlg, PrivateKey};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ---- upstream: a fake backing sshd that echoes stdin ----

/// Signals received by the fake upstream, in arrival order.
type SignalLog = Arc<StdMutex<Vec<String>>>;

struct UpstreamHandler {
    signals: SignalLog,
}

impl russh::server::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == "user" && password == "pw" {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        let _ = session.data(channel, CryptoVec::from_slice(data));
        let _ = session.exit_status_request(channel, 0);
        let _ = session.close(channel);
        Ok(())
    }

    async fn signal(
        &mut self,
        _channel: ChannelId,
        signal: russh::Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.signals.lock().unwrap().push(format!("{signal:?}"));
        Ok(())
    }

    /// Echo stdin back on stdout; "exit\n" terminates with status 0.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if data == b"exit\n" {
            let _ = session.exit_status_request(channel, 0);
            let _ = session.close(channel);
        } else {
            let _ = session.data(channel, CryptoVec::from_slice(data));
        }
        Ok(())
    }
}

struct UpstreamServer {
    signals: SignalLog,
}

impl russh::server::Server for UpstreamServer {
    type Handler = UpstreamHandler;

    fn new_client(&mut self, _peer: Option<std::net::SocketAddr>) -> UpstreamHandler {
        UpstreamHandler {
            signals: self.signals.clone(),
        }
    }
}

/// Start the fake backing server; returns its port, host key fingerprint,
/// and the log of signals it received.
async fn start_upstream() -> (u16, String, SignalLog) {
    let port = free_port().await;
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();
    let signals: SignalLog = Arc::new(StdMutex::new(Vec::new()));

    let mut config = russh::server::Config::default();
    config.keys.push(key);
    config.auth_rejection_time = Duration::from_millis(100);
    config.auth_rejection_time_initial = Some(Duration::from_millis(0));
    let config = Arc::new(config);

    let server_signals = signals.clone();
    tokio::spawn(async move {
        use russh::server::Server as _;
        let mut server = UpstreamServer {
            signals: server_signals,
        };
        let addr = format!("127.0.0.1:{port}");
        let _ = server.run_on_address(config, &addr as &str).await;
    });
    sleep(Duration::from_millis(200)).await;
    (port, fingerprint, signals)
}

/// Start the proxy pointed at `upstream_port`, pinning `fingerprint`.
async fn start_proxy(upstream_port: u16, fingerprint: &str) -> (u16, Arc<AppContext>) {
    let port = free_port().await;
    let toml_str = format!(
        r##"
[server]
listen = "127.0.0.1:{port}"

[upstream]
server = "127.0.0.1"
port = {upstream_port}
username = "user"
password = "pw"
allowedHostKeyFingerprints = ["{fingerprint}"]
timeout = 5

[logging]
level = "debug"
"##
    );
    let config = Arc::new(parse_config(&toml_str).unwrap());
    let metrics = Arc::new(MetricsRegistry::new());
    let ctx = Arc::new(AppContext::new(config.clone(), metrics).unwrap());

    let host_key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let ssh_config = build_server_config(&config, host_key);

    let listen = config.server.listen.clone();
    let server_ctx = ctx.clone();
    tokio::spawn(async move {
        use russh::server::Server as _;
        let mut server = ProxyServer { ctx: server_ctx };
        let _ = server.run_on_address(ssh_config, &listen as &str).await;
    });
    sleep(Duration::from_millis(200)).await;
    (port, ctx)
}

// ---- inbound test client ----

struct TestClientHandler;

impl russh::client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn connect_client(port: u16) -> russh::client::Handle<TestClientHandler> {
    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect(
        config,
        format!("127.0.0.1:{port}"),
        TestClientHandler,
    )
    .await
    .unwrap();
    let auth = handle.authenticate_none("alice").await.unwrap();
    assert!(auth.success(), "none auth should pass through the proxy");
    handle
}

/// Wait for `count` request confirmations, skipping unrelated messages.
async fn expect_successes(channel: &mut Channel<russh::client::Msg>, count: usize) {
    let mut seen = 0;
    while seen < count {
        match timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Success)) => seen += 1,
            Ok(Some(ChannelMsg::Failure)) => panic!("request rejected by proxy"),
            Ok(Some(_)) => {}
            Ok(None) => panic!("channel closed while waiting for replies"),
            Err(_) => panic!("timed out waiting for request replies"),
        }
    }
}

/// Wait for a single failure confirmation, skipping data in between.
async fn expect_failure(channel: &mut Channel<russh::client::Msg>) {
    loop {
        match timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Failure)) => return,
            Ok(Some(ChannelMsg::Success)) => panic!("request unexpectedly accepted"),
            Ok(Some(_)) => {}
            Ok(None) => panic!("channel closed while waiting for a failure reply"),
            Err(_) => panic!("timed out waiting for a failure reply"),
        }
    }
}

// ---- scenarios ----

/// Happy shell: env + pty + shell, stdin echoes to stdout, and the
/// upstream's exit status arrives on the inbound channel.
#[tokio::test]
async fn shell_round_trip_with_exit_status() {
    let (upstream_port, fingerprint, _signals) = start_upstream().await;
    let (proxy_port, ctx) = start_proxy(upstream_port, &fingerprint).await;

    let handle = connect_client(proxy_port).await;
    let mut channel = handle.channel_open_session().await.unwrap();

    channel.set_env(true, "LANG", "C").await.unwrap();
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.request_shell(true).await.unwrap();
    expect_successes(&mut channel, 3).await;

    channel.data(&b"hello\n"[..]).await.unwrap();
    let mut echoed = Vec::new();
    while !echoed.ends_with(b"hello\n") {
        match timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => echoed.extend_from_slice(&data),
            Ok(Some(_)) => {}
            Ok(None) => panic!("channel closed before echo arrived"),
            Err(_) => panic!("timed out waiting for echo"),
        }
    }

    channel.data(&b"exit\n"[..]).await.unwrap();
    let mut exit_status = None;
    loop {
        match timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::ExitStatus { exit_status: code })) => {
                exit_status = Some(code);
                break;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for exit status"),
        }
    }
    assert_eq!(exit_status, Some(0), "upstream exit status must propagate");

    assert_eq!(ctx.metrics.backend_requests_total.get(), 1);
    assert_eq!(
        ctx.metrics
            .backend_failures_total
            .get_or_create(&FailureLabel::handshake())
            .get(),
        0
    );
}

/// Pre-start requests are refused once the program started, and a second
/// start attempt on the same channel is refused outright.
#[tokio::test]
async fn started_channel_rejects_prestart_and_second_start() {
    let (upstream_port, fingerprint, _signals) = start_upstream().await;
    let (proxy_port, _ctx) = start_proxy(upstream_port, &fingerprint).await;

    let handle = connect_client(proxy_port).await;
    let mut channel = handle.channel_open_session().await.unwrap();

    channel.request_shell(true).await.unwrap();
    expect_successes(&mut channel, 1).await;

    // env after start
    channel.set_env(true, "LANG", "C").await.unwrap();
    expect_failure(&mut channel).await;

    // pty after start
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    expect_failure(&mut channel).await;

    // second start
    channel.request_shell(true).await.unwrap();
    expect_failure(&mut channel).await;

    // the first program keeps streaming regardless
    channel.data(&b"ping\n"[..]).await.unwrap();
    let mut echoed = Vec::new();
    while !echoed.ends_with(b"ping\n") {
        match timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => echoed.extend_from_slice(&data),
            Ok(Some(_)) => {}
            Ok(None) => panic!("channel closed before echo arrived"),
            Err(_) => panic!("timed out waiting for echo"),
        }
    }
}

/// Exec: the command runs (the fake upstream echoes it back as output) and
/// its exit status propagates.
#[tokio::test]
async fn exec_streams_output_and_exit_status() {
    let (upstream_port, fingerprint, _signals) = start_upstream().await;
    let (proxy_port, _ctx) = start_proxy(upstream_port, &fingerprint).await;

    let handle = connect_client(proxy_port).await;
    let mut channel = handle.channel_open_session().await.unwrap();

    channel.exec(true, &b"ls -l"[..]).await.unwrap();

    let mut output = Vec::new();
    let mut exit_status = None;
    loop {
        match timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => output.extend_from_slice(&data),
            Ok(Some(ChannelMsg::ExitStatus { exit_status: code })) => exit_status = Some(code),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for exec output"),
        }
        if exit_status.is_some() && output.ends_with(b"ls -l") {
            break;
        }
    }
    assert_eq!(output, b"ls -l".to_vec());
    assert_eq!(exit_status, Some(0));
}

/// Property 2: no inbound auth method succeeds inside the proxy.
#[tokio::test]
async fn inbound_authentication_is_refused() {
    let (upstream_port, fingerprint, _signals) = start_upstream().await;
    let (proxy_port, _ctx) = start_proxy(upstream_port, &fingerprint).await;

    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect(
        config,
        format!("127.0.0.1:{proxy_port}"),
        TestClientHandler,
    )
    .await
    .unwrap();

    let password_auth = handle.authenticate_password("user", "pw").await.unwrap();
    assert!(
        !password_auth.success(),
        "password auth must be refused by the proxy"
    );
}

/// Property 1 / S2: a backend whose host key fingerprint is not pinned is
/// rejected during the handshake; no session channel opens and the
/// handshake failure counter increments.
#[tokio::test]
async fn fingerprint_mismatch_aborts_backend_handshake() {
    let (upstream_port, _fingerprint, _signals) = start_upstream().await;
    let wrong = "SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    let (proxy_port, ctx) = start_proxy(upstream_port, wrong).await;

    let config = Arc::new(russh::client::Config::default());
    let connected = russh::client::connect(
        config,
        format!("127.0.0.1:{proxy_port}"),
        TestClientHandler,
    )
    .await;

    // The inbound connection is torn down when the backend handshake fails;
    // depending on timing the client observes it at auth or at channel open.
    if let Ok(mut handle) = connected {
        match handle.authenticate_none("alice").await {
            Ok(auth) if auth.success() => {
                assert!(
                    handle.channel_open_session().await.is_err(),
                    "no session channel may open after a fingerprint mismatch"
                );
            }
            _ => {}
        }
    }

    sleep(Duration::from_millis(200)).await;
    assert!(
        ctx.metrics
            .backend_failures_total
            .get_or_create(&FailureLabel::handshake())
            .get()
            >= 1,
        "fingerprint mismatch must count as a handshake failure"
    );
    assert_eq!(ctx.metrics.sessions_active.get(), 0);
}

/// S6-flavored teardown: dropping the inbound connection mid-session drains
/// the in-flight counter and releases the session slot.
#[tokio::test]
async fn disconnect_mid_session_drains_state() {
    let (upstream_port, fingerprint, _signals) = start_upstream().await;
    let (proxy_port, ctx) = start_proxy(upstream_port, &fingerprint).await;

    {
        let handle = connect_client(proxy_port).await;
        let mut channel = handle.channel_open_session().await.unwrap();
        channel.request_shell(true).await.unwrap();
        expect_successes(&mut channel, 1).await;
        channel.data(&b"hello\n"[..]).await.unwrap();
        assert_eq!(ctx.metrics.sessions_active.get(), 1);

        handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
            .unwrap();
    }

    // Teardown closes the backing connection and zeroes the gauge.
    let mut drained = false;
    for _ in 0..50 {
        if ctx.metrics.sessions_active.get() == 0 && ctx.connections.is_empty() {
            drained = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(drained, "disconnect must drain sessions and connection state");
}

/// Poll the upstream signal log until `name` appears.
async fn wait_for_signal(log: &SignalLog, name: &str) -> bool {
    for _ in 0..50 {
        if log.lock().unwrap().iter().any(|s| s == name) {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Post-start signals pass through, and S5: shutdown delivers TERM
/// immediately and escalates to KILL when the grace window expires without
/// the program exiting.
#[tokio::test]
async fn shutdown_escalates_term_then_kill() {
    let (upstream_port, fingerprint, signals) = start_upstream().await;
    let (proxy_port, ctx) = start_proxy(upstream_port, &fingerprint).await;

    let handle = connect_client(proxy_port).await;
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();
    expect_successes(&mut channel, 1).await;

    // A client-sent signal reaches the upstream once the program started.
    channel.signal(russh::Sig::HUP).await.unwrap();
    assert!(
        wait_for_signal(&signals, "HUP").await,
        "client signal must pass through to the upstream"
    );

    // Drive the per-channel shutdown escalation with a short grace window.
    for entry in ctx.connections.iter() {
        entry.value().begin_shutdown(Duration::from_millis(500));
    }

    assert!(
        wait_for_signal(&signals, "TERM").await,
        "TERM must be delivered at shutdown"
    );
    assert!(
        wait_for_signal(&signals, "KILL").await,
        "KILL must follow once the grace window expires"
    );
    let log = signals.lock().unwrap();
    let term_at = log.iter().position(|s| s == "TERM").unwrap();
    let kill_at = log.iter().position(|s| s == "KILL").unwrap();
    assert!(term_at < kill_at, "TERM must precede KILL: {log:?}");
}
