//! Per-connection proxy handler: rejects inbound authentication, builds the
//! backing SSH connection on handshake success, opens matching backend
//! session channels, and tears everything down when the user disconnects.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Result};
use russh::client;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::codes;
use crate::context::AppContext;
use crate::ssh::channel::SessionChannel;
use crate::ssh::upstream::{self, PinnedKeyVerifier};
use crate::utils::generate_correlation_id;

#[derive(Default)]
struct ConnFlags {
    disconnected: bool,
    done: bool,
}

/// State shared between the per-connection handler, its session channels,
/// and the teardown task that runs after the inbound connection ends.
///
/// The channels hold a non-owning position here: the connection outlives
/// every channel it spawned, and the in-flight counter plus the `done` flag
/// stand in for shared ownership.
pub struct ConnState {
    ctx: Arc<AppContext>,
    conn_id: String,
    peer: Option<SocketAddr>,
    upstream: Mutex<Option<client::Handle<PinnedKeyVerifier>>>,
    channels: dashmap::DashMap<ChannelId, Arc<Mutex<SessionChannel>>>,
    flags: StdMutex<ConnFlags>,
    inflight: watch::Sender<usize>,
}

impl ConnState {
    pub fn new(ctx: Arc<AppContext>, peer: Option<SocketAddr>) -> Arc<Self> {
        let (inflight, _) = watch::channel(0);
        let state = Arc::new(Self {
            ctx: ctx.clone(),
            conn_id: generate_correlation_id(),
            peer,
            upstream: Mutex::new(None),
            channels: dashmap::DashMap::new(),
            flags: StdMutex::new(ConnFlags::default()),
            inflight,
        });
        ctx.connections
            .insert(state.conn_id.clone(), state.clone());
        state
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn is_disconnected(&self) -> bool {
        self.flags.lock().unwrap().disconnected
    }

    /// Claim an in-flight session slot. Fails once the connection is
    /// draining: no new session channel is accepted after `done` is set.
    fn session_opened(&self) -> Result<()> {
        let flags = self.flags.lock().unwrap();
        if flags.done {
            bail!("connection is shutting down");
        }
        self.inflight.send_modify(|n| *n += 1);
        self.ctx.metrics.sessions_active.inc();
        Ok(())
    }

    pub(crate) fn session_closed(&self) {
        self.inflight.send_modify(|n| *n = n.saturating_sub(1));
        self.ctx.metrics.sessions_active.dec();
    }

    /// Refuse new sessions from now on (process shutdown path).
    pub fn set_draining(&self) {
        self.flags.lock().unwrap().done = true;
    }

    /// Escalate TERM then KILL on every open session channel.
    pub fn begin_shutdown(&self, grace: Duration) {
        for entry in self.channels.iter() {
            let chan = entry.value().clone();
            tokio::spawn(SessionChannel::shutdown(chan, grace));
        }
    }

    /// Runs after the inbound connection ends. Closes the surviving
    /// backing channels, waits for the in-flight session count to drain,
    /// marks the connection done, and disconnects the backing server.
    pub async fn on_disconnect(&self) {
        let remaining: Vec<_> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.channels.clear();
        for chan in remaining {
            chan.lock().await.on_close().await;
        }

        let mut drained = self.inflight.subscribe();
        let _ = drained.wait_for(|n| *n == 0).await;

        {
            let mut flags = self.flags.lock().unwrap();
            flags.done = true;
            flags.disconnected = true;
        }
        debug!(
            code = codes::DISCONNECTED,
            conn_id = %self.conn_id,
            "Client disconnected"
        );

        match self.upstream.lock().await.take() {
            Some(handle) => {
                debug!(conn_id = %self.conn_id, "Disconnecting backend connection");
                if handle
                    .disconnect(russh::Disconnect::ByApplication, "", "")
                    .await
                    .is_err()
                {
                    debug!(
                        code = codes::BACKEND_DISCONNECT_FAILED,
                        conn_id = %self.conn_id,
                        "Failed to disconnect backend connection"
                    );
                } else {
                    debug!(
                        code = codes::BACKEND_DISCONNECTED,
                        conn_id = %self.conn_id,
                        "Backend connection disconnected"
                    );
                }
            }
            None => {
                debug!(
                    code = codes::BACKEND_DISCONNECTED,
                    conn_id = %self.conn_id,
                    "Backend connection already disconnected"
                );
            }
        }

        self.ctx.connections.remove(&self.conn_id);
    }
}

/// Per-connection SSH handler
pub struct ProxyHandler {
    ctx: Arc<AppContext>,
    conn: Arc<ConnState>,
    username: Option<String>,
}

impl ProxyHandler {
    pub fn new(ctx: Arc<AppContext>, peer: Option<SocketAddr>) -> Self {
        ctx.metrics.connections_total.inc();
        let conn = ConnState::new(ctx.clone(), peer);
        Self {
            ctx,
            conn,
            username: None,
        }
    }

    pub fn conn_id(&self) -> &str {
        self.conn.conn_id()
    }

    pub fn conn_state(&self) -> Arc<ConnState> {
        self.conn.clone()
    }

    fn reject_auth(&self, username: &str, method: &str) -> Auth {
        debug!(
            code = codes::AUTH_UNAVAILABLE,
            conn_id = %self.conn.conn_id,
            user = %username,
            method = %method,
            "ssh proxy does not support authentication"
        );
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn channel(&self, id: ChannelId) -> Option<Arc<Mutex<SessionChannel>>> {
        self.conn.channels.get(&id).map(|entry| entry.value().clone())
    }
}

impl Drop for ProxyHandler {
    fn drop(&mut self) {
        let conn = self.conn.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { conn.on_disconnect().await });
        }
    }
}

impl Handler for ProxyHandler {
    type Error = anyhow::Error;

    /// The proxy does not gate access; the backing server does. The client
    /// authenticates with the `none` method and the real credential check
    /// happens on the backend handshake in `auth_succeeded`.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.reject_auth(user, "password"))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.reject_auth(user, "publickey"))
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        Ok(self.reject_auth(user, "keyboard-interactive"))
    }

    /// Handshake success on the inbound side: establish the backing SSH
    /// connection. Failure here aborts the inbound connection.
    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        if self.conn.is_disconnected() {
            debug!(
                code = codes::DISCONNECTED,
                conn_id = %self.conn.conn_id,
                "Could not connect to backend because the user already disconnected"
            );
            bail!("could not connect to backend because the user already disconnected");
        }

        let username = self.username.clone().unwrap_or_default();
        let handle = upstream::connect_backend(&self.ctx, &self.conn.conn_id, &username).await?;
        *self.conn.upstream.lock().await = Some(handle);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.conn.session_opened().is_err() {
            warn!(
                code = codes::SHUTTING_DOWN,
                conn_id = %self.conn.conn_id,
                "Rejected session channel: connection is shutting down"
            );
            return Ok(false);
        }

        let upstream_guard = self.conn.upstream.lock().await;
        let Some(handle) = upstream_guard.as_ref() else {
            debug!(
                code = codes::BACKEND_SESSION_FAILED,
                conn_id = %self.conn.conn_id,
                "No backend connection available for the session channel"
            );
            self.conn.session_closed();
            return Ok(false);
        };

        match handle.channel_open_session().await {
            Ok(backing) => {
                let id = channel.id();
                let sc = SessionChannel::new(
                    self.conn.conn_id.clone(),
                    session.handle(),
                    channel,
                    backing,
                    self.conn.clone(),
                );
                self.conn.channels.insert(id, Arc::new(Mutex::new(sc)));
                info!(
                    conn_id = %self.conn.conn_id,
                    peer = ?self.conn.peer,
                    "Session opened"
                );
                Ok(true)
            }
            Err(e) => {
                self.conn.session_closed();
                debug!(
                    code = codes::BACKEND_SESSION_FAILED,
                    conn_id = %self.conn.conn_id,
                    error = %e,
                    "Backend rejected session channel"
                );
                Ok(false)
            }
        }
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            match chan.lock().await.env(variable_name, variable_value).await {
                Ok(()) => {
                    let _ = session.channel_success(channel);
                }
                Err(_) => {
                    let _ = session.channel_failure(channel);
                }
            }
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            match chan
                .lock()
                .await
                .pty(term, col_width, row_height, pix_width, pix_height, modes)
                .await
            {
                Ok(()) => {
                    let _ = session.channel_success(channel);
                }
                Err(_) => {
                    let _ = session.channel_failure(channel);
                }
            }
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            match SessionChannel::exec(&chan, data.to_vec()).await {
                Ok(()) => {
                    let _ = session.channel_success(channel);
                }
                Err(_) => {
                    let _ = session.channel_failure(channel);
                }
            }
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            match SessionChannel::shell(&chan).await {
                Ok(()) => {
                    let _ = session.channel_success(channel);
                }
                Err(_) => {
                    let _ = session.channel_failure(channel);
                }
            }
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            match SessionChannel::subsystem(&chan, name).await {
                Ok(()) => {
                    let _ = session.channel_success(channel);
                }
                Err(_) => {
                    let _ = session.channel_failure(channel);
                }
            }
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            let _ = chan.lock().await.signal(signal).await;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            let _ = chan
                .lock()
                .await
                .window_change(col_width, row_height, pix_width, pix_height)
                .await;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            chan.lock().await.data(data).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(chan) = self.channel(channel) {
            chan.lock().await.inbound_eof().await;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some((_, chan)) = self.conn.channels.remove(&channel) {
            chan.lock().await.on_close().await;
        }
        Ok(())
    }
}
