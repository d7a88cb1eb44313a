//! Per-session channel bridging: the pre-start/post-start request state
//! machine, the stdio pumps, and the TERM/KILL shutdown escalation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use russh::server::{self, Handle};
use russh::{client, ChannelId, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, CryptoVec, Pty, Sig};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::codes;
use crate::ssh::handler::ConnState;

/// One proxied session channel.
///
/// The channel is `PRE_START` until exactly one of exec/shell/subsystem
/// succeeds against the backend, after which it is `STARTED` and streaming.
/// `started` never flips back: a rejected start leaves the channel burned
/// and the client is expected to open a new one.
pub struct SessionChannel {
    conn_id: String,
    inbound: Handle,
    inbound_id: ChannelId,
    // Held for its side effect: the inbound channel stays registered with
    // the server session for as long as this state exists.
    _inbound_channel: russh::Channel<server::Msg>,
    conn: Arc<ConnState>,
    upstream: ChannelWriteHalf<client::Msg>,
    upstream_read: Option<ChannelReadHalf>,
    started: bool,
    exited: bool,
    done_tx: watch::Sender<bool>,
}

impl SessionChannel {
    pub fn new(
        conn_id: String,
        inbound: Handle,
        inbound_channel: russh::Channel<server::Msg>,
        upstream: russh::Channel<client::Msg>,
        conn: Arc<ConnState>,
    ) -> Self {
        let (read, write) = upstream.split();
        let (done_tx, _) = watch::channel(false);
        Self {
            conn_id,
            inbound,
            inbound_id: inbound_channel.id(),
            _inbound_channel: inbound_channel,
            conn,
            upstream: write,
            upstream_read: Some(read),
            started: false,
            exited: false,
            done_tx,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    /// Wait for the backend's reply to a request sent with want-reply.
    /// Before the program starts no data flows, so the next meaningful
    /// message on the channel is the success/failure reply.
    async fn await_reply(&mut self) -> Result<bool> {
        let read = match self.upstream_read.as_mut() {
            Some(read) => read,
            None => bail!("backing channel is already streaming"),
        };
        loop {
            match read.wait().await {
                Some(ChannelMsg::Success) => return Ok(true),
                Some(ChannelMsg::Failure) => return Ok(false),
                Some(_) => continue,
                None => bail!("backing channel closed"),
            }
        }
    }

    pub async fn env(&mut self, name: &str, value: &str) -> Result<()> {
        if self.started {
            debug!(
                code = codes::PROGRAM_ALREADY_STARTED,
                conn_id = %self.conn_id,
                "Client tried to set an environment variable after the program started"
            );
            bail!("cannot set environment variable after program has started");
        }
        match self.upstream.set_env(true, name, value).await {
            Ok(()) => {}
            Err(e) => {
                debug!(
                    code = codes::SETENV_FAILED,
                    conn_id = %self.conn_id,
                    error = %e,
                    "Setting environment variable on backing channel failed"
                );
                bail!("cannot set environment variable");
            }
        }
        if !self.await_reply().await.unwrap_or(false) {
            debug!(
                code = codes::SETENV_FAILED,
                conn_id = %self.conn_id,
                "Backend rejected environment variable"
            );
            bail!("cannot set environment variable");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn pty(
        &mut self,
        term: &str,
        columns: u32,
        rows: u32,
        width: u32,
        height: u32,
        modes: &[(Pty, u32)],
    ) -> Result<()> {
        if self.started {
            debug!(
                code = codes::PROGRAM_ALREADY_STARTED,
                conn_id = %self.conn_id,
                "Client tried to request a PTY after the program started"
            );
            bail!("cannot request PTY after program has started");
        }
        match self
            .upstream
            .request_pty(true, term, columns, rows, width, height, modes)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                debug!(
                    code = codes::SETENV_FAILED,
                    conn_id = %self.conn_id,
                    error = %e,
                    "PTY request on backing channel failed"
                );
                bail!("cannot request PTY");
            }
        }
        if !self.await_reply().await.unwrap_or(false) {
            debug!(
                code = codes::SETENV_FAILED,
                conn_id = %self.conn_id,
                "Backend rejected PTY request"
            );
            bail!("cannot request PTY");
        }
        Ok(())
    }

    /// Start `exec`. `started` flips before the backend answers, so a
    /// rejected exec still locks out later start attempts on this channel.
    pub async fn exec(chan: &Arc<Mutex<SessionChannel>>, program: Vec<u8>) -> Result<()> {
        let mut sc = chan.lock().await;
        sc.check_not_started()?;
        sc.started = true;
        match sc.upstream.exec(true, program).await {
            Ok(()) => {}
            Err(e) => {
                debug!(
                    code = codes::SETENV_FAILED,
                    conn_id = %sc.conn_id,
                    error = %e,
                    "Exec request on backing channel failed"
                );
                bail!("cannot start program");
            }
        }
        if !sc.await_reply().await.unwrap_or(false) {
            debug!(
                code = codes::SETENV_FAILED,
                conn_id = %sc.conn_id,
                "Backend rejected exec request"
            );
            bail!("cannot start program");
        }
        sc.stream_stdio(chan.clone());
        Ok(())
    }

    pub async fn shell(chan: &Arc<Mutex<SessionChannel>>) -> Result<()> {
        let mut sc = chan.lock().await;
        sc.check_not_started()?;
        sc.started = true;
        match sc.upstream.request_shell(true).await {
            Ok(()) => {}
            Err(e) => {
                debug!(
                    code = codes::SETENV_FAILED,
                    conn_id = %sc.conn_id,
                    error = %e,
                    "Shell request on backing channel failed"
                );
                bail!("cannot start shell");
            }
        }
        if !sc.await_reply().await.unwrap_or(false) {
            debug!(
                code = codes::SETENV_FAILED,
                conn_id = %sc.conn_id,
                "Backend rejected shell request"
            );
            bail!("cannot start shell");
        }
        sc.stream_stdio(chan.clone());
        Ok(())
    }

    pub async fn subsystem(chan: &Arc<Mutex<SessionChannel>>, name: &str) -> Result<()> {
        let mut sc = chan.lock().await;
        sc.check_not_started()?;
        sc.started = true;
        match sc.upstream.request_subsystem(true, name).await {
            Ok(()) => {}
            Err(e) => {
                debug!(
                    code = codes::SETENV_FAILED,
                    conn_id = %sc.conn_id,
                    error = %e,
                    "Subsystem request on backing channel failed"
                );
                bail!("cannot start subsystem");
            }
        }
        if !sc.await_reply().await.unwrap_or(false) {
            debug!(
                code = codes::SETENV_FAILED,
                conn_id = %sc.conn_id,
                "Backend rejected subsystem request"
            );
            bail!("cannot start subsystem");
        }
        sc.stream_stdio(chan.clone());
        Ok(())
    }

    fn check_not_started(&self) -> Result<()> {
        if self.started {
            debug!(
                code = codes::PROGRAM_ALREADY_STARTED,
                conn_id = %self.conn_id,
                "Client tried to start a second program on the same channel"
            );
            bail!("cannot start new program after program has started");
        }
        Ok(())
    }

    pub async fn signal(&mut self, signal: Sig) -> Result<()> {
        if !self.started {
            debug!(
                code = codes::PROGRAM_NOT_STARTED,
                conn_id = %self.conn_id,
                "Client tried to send a signal before the program started"
            );
            bail!("cannot signal before program has started");
        }
        if let Err(e) = self.upstream.signal(signal).await {
            debug!(
                code = codes::BACKEND_SIGNAL_FAILED,
                conn_id = %self.conn_id,
                error = %e,
                "Failed to deliver signal on backing channel"
            );
            bail!("cannot deliver signal");
        }
        Ok(())
    }

    pub async fn window_change(
        &mut self,
        columns: u32,
        rows: u32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if !self.started {
            debug!(
                code = codes::PROGRAM_NOT_STARTED,
                conn_id = %self.conn_id,
                "Client tried to resize the window before the program started"
            );
            bail!("cannot resize window before program has started");
        }
        if let Err(e) = self
            .upstream
            .window_change(columns, rows, width, height)
            .await
        {
            debug!(
                code = codes::BACKEND_WINDOW_CHANGE_FAILED,
                conn_id = %self.conn_id,
                error = %e,
                "Failed to change window size on backing channel"
            );
            bail!("cannot change window size");
        }
        Ok(())
    }

    /// Inbound stdin bytes, forwarded to the backing channel.
    pub async fn data(&mut self, data: &[u8]) {
        if !self.started {
            return;
        }
        if let Err(e) = self.upstream.data(data).await {
            debug!(
                code = codes::STDIN_ERROR,
                conn_id = %self.conn_id,
                error = %e,
                "Error copying stdin to the backing channel"
            );
        }
    }

    /// Inbound stdin reached EOF: half-close the backing channel for
    /// writing, then close it, so the backend program sees a clean EOF.
    pub async fn inbound_eof(&mut self) {
        if let Err(e) = self.upstream.eof().await {
            debug!(
                code = codes::BACKING_CHANNEL_CLOSE_FAILED,
                conn_id = %self.conn_id,
                error = %e,
                "Failed to close the backing channel for writing"
            );
        }
        if let Err(e) = self.upstream.close().await {
            debug!(
                code = codes::BACKING_CHANNEL_CLOSE_FAILED,
                conn_id = %self.conn_id,
                error = %e,
                "Failed to close the backing channel"
            );
        }
    }

    /// The inbound channel was closed by the user.
    pub async fn on_close(&mut self) {
        if let Err(e) = self.upstream.close().await {
            debug!(
                code = codes::BACKING_CHANNEL_CLOSE_FAILED,
                conn_id = %self.conn_id,
                error = %e,
                "Failed to close the backing channel"
            );
        }
        self.mark_exited();
    }

    /// Signal the done channel and release the in-flight session slot.
    /// Idempotent; every exit path funnels through here exactly once.
    fn mark_exited(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;
        let _ = self.done_tx.send(true);
        self.conn.session_closed();
    }

    /// Spawn the streaming phase: one task drains the backing channel
    /// (stdout, stderr, exit notifications) into the inbound session, then
    /// half-closes the inbound side for writing before fully closing it.
    fn stream_stdio(&mut self, chan: Arc<Mutex<SessionChannel>>) {
        let Some(read) = self.upstream_read.take() else {
            return;
        };
        let inbound = self.inbound.clone();
        let inbound_id = self.inbound_id;
        let conn_id = self.conn_id.clone();
        tokio::spawn(pump_upstream(read, inbound, inbound_id, conn_id, chan));
    }

    /// Process shutdown: deliver TERM on the backing channel immediately,
    /// then KILL once the grace window expires, unless the channel exits
    /// first. KILL is never sent without TERM having been attempted.
    pub async fn shutdown(chan: Arc<Mutex<SessionChannel>>, grace: Duration) {
        let mut done_rx = {
            let sc = chan.lock().await;
            if sc.exited {
                return;
            }
            debug!(
                code = codes::SHUTDOWN,
                conn_id = %sc.conn_id,
                "Sending TERM signal on backing channel"
            );
            if let Err(e) = sc.upstream.signal(Sig::TERM).await {
                debug!(
                    code = codes::BACKEND_SIGNAL_FAILED,
                    conn_id = %sc.conn_id,
                    error = %e,
                    "Failed to deliver TERM signal to backend"
                );
            }
            sc.done_tx.subscribe()
        };

        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                let sc = chan.lock().await;
                if !sc.exited {
                    debug!(
                        code = codes::SHUTDOWN,
                        conn_id = %sc.conn_id,
                        "Sending KILL signal on backing channel"
                    );
                    if let Err(e) = sc.upstream.signal(Sig::KILL).await {
                        debug!(
                            code = codes::BACKEND_SIGNAL_FAILED,
                            conn_id = %sc.conn_id,
                            error = %e,
                            "Failed to deliver KILL signal to backend"
                        );
                    }
                }
            }
            _ = async {
                while !*done_rx.borrow() {
                    if done_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {}
        }
    }
}

/// Drain the backing channel into the inbound session.
///
/// Data goes to inbound stdout, extended data stream 1 to inbound stderr,
/// and exit-status/exit-signal notifications to the matching inbound
/// control requests. End-of-stream is normal and silent; other errors are
/// logged at debug and never abort the remaining traffic.
async fn pump_upstream(
    mut read: ChannelReadHalf,
    inbound: Handle,
    inbound_id: ChannelId,
    conn_id: String,
    chan: Arc<Mutex<SessionChannel>>,
) {
    while let Some(msg) = read.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                if inbound
                    .data(inbound_id, CryptoVec::from_slice(&data))
                    .await
                    .is_err()
                {
                    debug!(
                        code = codes::STDOUT_ERROR,
                        conn_id = %conn_id,
                        "Error copying stdout to the inbound channel"
                    );
                    break;
                }
            }
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                if inbound
                    .extended_data(inbound_id, 1, CryptoVec::from_slice(&data))
                    .await
                    .is_err()
                {
                    debug!(
                        code = codes::STDERR_ERROR,
                        conn_id = %conn_id,
                        "Error copying stderr to the inbound channel"
                    );
                    break;
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                let _ = inbound.exit_status_request(inbound_id, exit_status).await;
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                let _ = inbound
                    .exit_signal_request(
                        inbound_id,
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    )
                    .await;
            }
            ChannelMsg::Close => break,
            // Eof alone is not terminal: the exit status may follow it.
            _ => {}
        }
    }

    // Half-close the inbound side for writing only after both output
    // streams have drained, then close it.
    if inbound.eof(inbound_id).await.is_err() {
        debug!(
            code = codes::CHANNEL_CLOSE_FAILED,
            conn_id = %conn_id,
            "Failed to close the inbound channel for writing"
        );
    }
    if inbound.close(inbound_id).await.is_err() {
        debug!(
            code = codes::CHANNEL_CLOSE_FAILED,
            conn_id = %conn_id,
            "Failed to close the inbound channel"
        );
    }

    chan.lock().await.mark_exited();
}
