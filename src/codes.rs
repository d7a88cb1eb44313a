//! Stable event identifiers attached to log records as the `code` field.
//!
//! Operators grep and alert on these; the strings never change meaning. They
//! carry no control-flow significance except where the handlers explicitly
//! branch on an outcome before logging one.

/// The connection to the designated backing server failed. Logged on debug
/// while the dial deadline has not expired (the dial will be retried) and on
/// error once the proxy gives up.
pub const BACKEND_CONNECTION_FAILED: &str = "BACKEND_CONNECTION_FAILED";

/// The operation couldn't complete because the user already disconnected.
pub const DISCONNECTED: &str = "DISCONNECTED";

/// The backing server refused our handshake or authentication attempt,
/// usually due to misconfigured credentials. Error level.
pub const BACKEND_HANDSHAKE_FAILED: &str = "BACKEND_HANDSHAKE_FAILED";

/// The backing server presented a host key whose fingerprint is not in the
/// allow-list: either a configuration gap or a MITM between the proxy and the
/// backing server. Error level; the handshake is aborted.
pub const INVALID_FINGERPRINT: &str = "INVALID_FINGERPRINT";

/// The client attempted a pre-start operation after the program started.
pub const PROGRAM_ALREADY_STARTED: &str = "PROGRAM_ALREADY_STARTED";

/// The client attempted a post-start operation before starting a program.
pub const PROGRAM_NOT_STARTED: &str = "PROGRAM_NOT_STARTED";

/// Copying stdin to the backing channel failed. Debug level; usually an
/// underlying network problem.
pub const STDIN_ERROR: &str = "STDIN_ERROR";

/// Copying stdout from the backing channel failed. Debug level.
pub const STDOUT_ERROR: &str = "STDOUT_ERROR";

/// Copying stderr from the backing channel failed. Debug level.
pub const STDERR_ERROR: &str = "STDERR_ERROR";

/// The proxy is connecting to the backing server. Debug level.
pub const CONNECTING: &str = "CONNECTING";

/// The backing server rejected a forwarded channel request. Debug level.
pub const SETENV_FAILED: &str = "SETENV_FAILED";

/// Closing the backing channel failed, usually because the backing
/// connection is already gone. Debug level, non-fatal.
pub const BACKING_CHANNEL_CLOSE_FAILED: &str = "BACKING_CHANNEL_CLOSE_FAILED";

/// The window-change request could not be delivered to the backing channel.
pub const BACKEND_WINDOW_CHANGE_FAILED: &str = "BACKEND_WINDOW_CHANGE_FAILED";

/// The proxy is shutting the session down and escalating TERM then KILL on
/// the backing channel. Debug level.
pub const SHUTDOWN: &str = "SHUTDOWN";

/// A signal could not be delivered on the backing channel. Debug level.
pub const BACKEND_SIGNAL_FAILED: &str = "BACKEND_SIGNAL_FAILED";

/// Closing the inbound channel failed. Debug level, non-fatal.
pub const CHANNEL_CLOSE_FAILED: &str = "CHANNEL_CLOSE_FAILED";

/// The backing server rejected the session channel open.
pub const BACKEND_SESSION_FAILED: &str = "BACKEND_SESSION_FAILED";

/// The proxy refused a new session because the connection is draining.
pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";

/// Disconnecting from the backing server failed. Debug level, non-fatal.
pub const BACKEND_DISCONNECT_FAILED: &str = "BACKEND_DISCONNECT_FAILED";

/// The backing connection was torn down after the user disconnected.
pub const BACKEND_DISCONNECTED: &str = "BACKEND_DISCONNECTED";

/// Inbound authentication was attempted; the proxy does not authenticate.
pub const AUTH_UNAVAILABLE: &str = "AUTH_UNAVAILABLE";
