//! Demo application: keeps a TCP connection to a configured server open,
//! reconnecting with exponential backoff.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use udaemon_runtime::{
    set_log_level, Dispatch, HandlerId, HookResult, Interest, LogLevel, PollEvent, Runtime,
    RuntimeConfig, RuntimeError, Signal, TaskStatus,
};

use crate::config::{self, AppConfig};

pub type DemoRuntime = Runtime<AppConfig>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(64);
const READ_CHUNK: usize = 128;

struct Connection {
    stream: TcpStream,
    handler: HandlerId,
}

/// Application state stored in the runtime.
#[derive(Default)]
pub struct RunState {
    connection: RefCell<Option<Connection>>,
    /// A reconnect task is scheduled and has not finished yet.
    reconnect_pending: Cell<bool>,
}

impl RunState {
    pub fn is_connected(&self) -> bool {
        self.connection.borrow().is_some()
    }

    /// Schedule an immediate reconnect unless one is already underway.
    fn schedule_reconnect(self: &Rc<Self>, rt: &DemoRuntime) -> Result<(), RuntimeError> {
        if self.reconnect_pending.replace(true) {
            tracing::debug!("reconnect already pending");
            return Ok(());
        }
        rt.schedule_task(Duration::ZERO, reconnect, Rc::clone(self))
            .map_err(|err| {
                self.reconnect_pending.set(false);
                err
            })
    }

    fn disconnect(&self, rt: &DemoRuntime) {
        let Some(connection) = self.connection.borrow_mut().take() else {
            return;
        };
        if let Err(err) = rt.remove_event_handler(connection.handler) {
            tracing::debug!(error = %err, "event handler already gone");
        }
        tracing::debug!(fd = connection.stream.as_raw_fd(), "disconnected");
    }
}

/// Attach the demo's hooks and its configuration parser to `config`.
pub fn configure(config: RuntimeConfig<AppConfig>) -> RuntimeConfig<AppConfig> {
    config
        .on_initialize(initialize)
        .on_signal(on_signal)
        .on_cleanup(cleanup)
        .on_config_parse(config::parse)
        .on_config_cleanup(config::release)
}

fn run_state(rt: &DemoRuntime) -> Result<Rc<RunState>> {
    rt.app_state::<RunState>()
        .ok_or_else(|| anyhow!("application state is not installed"))
}

fn initialize(rt: &DemoRuntime) -> HookResult {
    tracing::debug!(
        version = udaemon_runtime::version(),
        config = rt.app_config().is_some(),
        "initializing demo"
    );
    let state = run_state(rt)?;
    state.schedule_reconnect(rt)?;
    Ok(())
}

fn cleanup(rt: &DemoRuntime) -> HookResult {
    tracing::debug!("cleaning up demo");
    run_state(rt)?.disconnect(rt);
    Ok(())
}

fn on_signal(rt: &DemoRuntime, signal: Signal) {
    match signal {
        Signal::Reload => match run_state(rt) {
            Ok(state) => {
                if let Err(err) = state.schedule_reconnect(rt) {
                    tracing::warn!(error = %err, "cannot schedule reconnect");
                }
            }
            Err(err) => tracing::warn!(error = %err, "reload ignored"),
        },
        Signal::DebugOn => {
            tracing::info!("turning on debug logging");
            set_log_level(LogLevel::Debug);
        }
        Signal::DebugOff => {
            tracing::info!("turning off debug logging");
            set_log_level(LogLevel::Info);
        }
        Signal::Terminate => tracing::info!("terminating"),
    }
}

/// Next retry interval: 1s after the first failure, doubling up to 64s.
pub fn next_backoff(interval: Duration) -> Duration {
    if interval.is_zero() {
        Duration::from_secs(1)
    } else {
        interval.saturating_mul(2).min(MAX_BACKOFF)
    }
}

fn reconnect(rt: &DemoRuntime, interval: Duration, state: &mut Rc<RunState>) -> TaskStatus {
    if state.is_connected() {
        tracing::debug!(?interval, "reconnecting to server");
        state.disconnect(rt);
    } else {
        tracing::debug!(?interval, "connecting to server");
    }

    let Some(config) = rt.app_config() else {
        tracing::error!("no application configuration, giving up");
        state.reconnect_pending.set(false);
        return TaskStatus::Abort;
    };

    let stream = match open_stream(&config) {
        Ok(stream) => stream,
        Err(err) => {
            let retry = next_backoff(interval);
            tracing::warn!(error = %format!("{err:#}"), ?retry, "cannot connect to server");
            return TaskStatus::Reschedule(retry);
        }
    };

    let registered = rt.add_event_handler(
        stream.as_raw_fd(),
        Interest::POLLIN,
        on_server_event,
        Rc::clone(state),
    );
    state.reconnect_pending.set(false);
    match registered {
        Ok(handler) => {
            tracing::info!(server = %config.server_host, port = config.server_port, "connected");
            *state.connection.borrow_mut() = Some(Connection { stream, handler });
            TaskStatus::Complete
        }
        Err(err) => {
            tracing::error!(error = %err, "cannot watch server connection");
            TaskStatus::Abort
        }
    }
}

fn open_stream(config: &AppConfig) -> Result<TcpStream> {
    let target = (config.server_host.as_str(), config.server_port);
    let addrs = target
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}:{}", target.0, target.1))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(mut stream) => {
                writeln!(stream, "{}", config.message).context("cannot send greeting")?;
                stream
                    .set_nonblocking(true)
                    .context("cannot make connection non-blocking")?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => anyhow::Error::new(err)
            .context(format!("cannot connect to {}:{}", target.0, target.1)),
        None => anyhow!("{}:{} resolved to no address", target.0, target.1),
    })
}

fn on_server_event(rt: &DemoRuntime, event: &mut PollEvent, state: &mut Rc<RunState>) -> Dispatch {
    let mut lost = event.is_hangup();

    if event.is_readable() {
        let mut buf = [0u8; READ_CHUNK];
        let read = match state.connection.borrow().as_ref() {
            Some(connection) => (&connection.stream).read(&mut buf),
            None => return Dispatch::Continue,
        };
        match read {
            Ok(0) => lost = true,
            Ok(n) => tracing::info!(bytes = n, "read from server"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => tracing::warn!(error = %err, "read from server failed"),
        }
    }

    if lost {
        tracing::info!("connection closed by server");
        // Stop polling for input until the reconnect replaces this handler.
        event.events.remove(Interest::POLLIN);
        if let Err(err) = state.schedule_reconnect(rt) {
            tracing::warn!(error = %err, "cannot schedule reconnect");
        }
    }
    Dispatch::Continue
}
