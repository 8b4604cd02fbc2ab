//! Raw CDP pipe over a chromiumoxide websocket connection.
//!
//! Commands are submitted by method name with JSON params; a single select
//! loop owns the connection, routes responses back through oneshot channels
//! keyed by call id, and drains protocol events. A heartbeat keeps the
//! connection honest and flips the liveness flag when the browser goes away.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide_types::{CallId, MethodId, Message, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::launch::SessionConfig;
use crate::SessionError;

/// Whether a command addresses the browser endpoint or an attached page.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

struct Command {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, SessionError>>,
}

pub struct Transport {
    command_tx: mpsc::Sender<Command>,
    deadline: Duration,
    alive: Arc<AtomicBool>,
    loop_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
}

impl Transport {
    /// Launch the browser and connect. Retries with a profile purge between
    /// attempts; a stale singleton lock from a crashed run is the usual
    /// reason a launch fails.
    pub async fn launch(cfg: &SessionConfig) -> Result<Self, SessionError> {
        let mut last_err = SessionError::Launch("no launch attempt made".to_string());
        for attempt in 1..=cfg.launch_attempts.max(1) {
            match Self::launch_once(cfg).await {
                Ok(transport) => return Ok(transport),
                Err(err) => {
                    warn!(target: "cdp-session", attempt, %err, "browser launch attempt failed");
                    last_err = err;
                    if let Err(purge_err) = fs::remove_dir_all(&cfg.user_data_dir) {
                        if purge_err.kind() != std::io::ErrorKind::NotFound {
                            debug!(target: "cdp-session", %purge_err, "profile purge failed");
                        }
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn launch_once(cfg: &SessionConfig) -> Result<Self, SessionError> {
        let browser_cfg = browser_config(cfg)?;
        let mut child = browser_cfg
            .launch()
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        let ws_url = extract_ws_url(&mut child).await?;

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| SessionError::Io(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let alive = Arc::new(AtomicBool::new(true));

        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            if let Err(err) = run_loop(conn, command_rx).await {
                error!(target: "cdp-session", %err, "cdp loop terminated");
            }
            loop_alive.store(false, Ordering::Relaxed);
        });

        let heartbeat_task = spawn_heartbeat(
            command_tx.clone(),
            alive.clone(),
            cfg.heartbeat_interval,
            cfg.command_deadline,
        );

        info!(target: "cdp-session", url = %ws_url, "browser connected");

        Ok(Self {
            command_tx,
            deadline: cfg.command_deadline,
            alive,
            loop_task,
            heartbeat_task,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Submit one command and wait for its response payload.
    pub async fn send(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, SessionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let command = Command {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionError::Io("cdp command channel closed".to_string()))?;

        match timeout(self.deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Io(
                "cdp response channel closed".to_string(),
            )),
            Err(_) => Err(SessionError::Timeout(format!("{method} got no response"))),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Some(handle) = &self.heartbeat_task {
            handle.abort();
        }

        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = child.kill().await {
                            warn!(target: "cdp-session", %err, "failed to kill browser child");
                        }
                    });
                } else {
                    debug!(target: "cdp-session", "no runtime available to kill browser child");
                }
            }
        }
    }
}

fn browser_config(cfg: &SessionConfig) -> Result<BrowserConfig, SessionError> {
    if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
        return Err(SessionError::Launch(format!(
            "chrome executable not found at {} (set TIXRACE_CHROME)",
            cfg.executable.display()
        )));
    }

    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        std::env::current_dir()
            .map_err(|err| SessionError::Launch(format!("cannot resolve cwd: {err}")))?
            .join(&cfg.user_data_dir)
    };
    fs::create_dir_all(&profile_dir)
        .map_err(|err| SessionError::Launch(format!("cannot create profile dir: {err}")))?;

    let mut builder = BrowserConfig::builder()
        .request_timeout(cfg.command_deadline)
        .launch_timeout(Duration::from_secs(20));

    if !cfg.headless {
        builder = builder.with_head();
    }

    if std::env::var("TIXRACE_DISABLE_SANDBOX")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        builder = builder.no_sandbox();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--disable-sync",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
        "--use-mock-keychain",
    ];
    if cfg.headless {
        args.push("--headless=new");
        args.push("--mute-audio");
    }
    builder = builder.args(args);

    if !cfg.executable.as_os_str().is_empty() {
        builder = builder.chrome_executable(cfg.executable.clone());
    }
    builder = builder.user_data_dir(profile_dir);

    builder
        .build()
        .map_err(|err| SessionError::Launch(format!("browser config error: {err}")))
}

/// Read the DevTools websocket URL off the browser's stderr.
async fn extract_ws_url(child: &mut Child) -> Result<String, SessionError> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SessionError::Launch("browser process has no stderr handle".to_string()))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut preview = Vec::new();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| SessionError::Launch(err.to_string()))?;
            if preview.len() < 8 {
                preview.push(line.clone());
            }
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(SessionError::Launch(format!(
            "browser exited before exposing a devtools url. stderr: {}",
            preview.join(" | ")
        )))
    };

    timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| SessionError::Timeout("waiting for devtools websocket url".to_string()))?
}

async fn run_loop(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<Command>,
) -> Result<(), SessionError> {
    let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, SessionError>>> =
        HashMap::new();

    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => {
                submit(&mut conn, command, &mut inflight)?;
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => {
                        if let Some(sender) = inflight.remove(&resp.id) {
                            let _ = sender.send(extract_payload(resp));
                        }
                    }
                    Some(Ok(Message::Event(event))) => {
                        // Protocol events are not consumed anywhere; the
                        // race logic polls the page instead.
                        trace!(target: "cdp-session", ?event, "cdp event");
                    }
                    Some(Err(err)) => {
                        let err = SessionError::Io(err.to_string());
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(err.clone()));
                        }
                        return Err(err);
                    }
                    None => {
                        let err = SessionError::Io("cdp connection closed".to_string());
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(err.clone()));
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn submit(
    conn: &mut Connection<CdpEventMessage>,
    command: Command,
    inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, SessionError>>>,
) -> Result<(), SessionError> {
    let session = match command.target {
        CommandTarget::Browser => None,
        CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
    };
    let method: MethodId = command.method.clone().into();
    match conn.submit_command(method, session, command.params) {
        Ok(call_id) => {
            inflight.insert(call_id, command.responder);
            Ok(())
        }
        Err(err) => {
            let err = SessionError::Io(err.to_string());
            let _ = command.responder.send(Err(err.clone()));
            Err(err)
        }
    }
}

fn extract_payload(resp: Response) -> Result<Value, SessionError> {
    if let Some(result) = resp.result {
        Ok(result)
    } else if let Some(error) = resp.error {
        Err(SessionError::Io(format!(
            "cdp error {}: {}",
            error.code, error.message
        )))
    } else {
        Err(SessionError::Io("empty cdp response".to_string()))
    }
}

fn spawn_heartbeat(
    sender: mpsc::Sender<Command>,
    alive: Arc<AtomicBool>,
    period: Duration,
    deadline: Duration,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    let deadline = deadline.min(Duration::from_secs(5));

    Some(tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;
            if !alive.load(Ordering::Relaxed) {
                break;
            }

            let (resp_tx, resp_rx) = oneshot::channel();
            let ping = Command {
                target: CommandTarget::Browser,
                method: "Browser.getVersion".to_string(),
                params: json!({}),
                responder: resp_tx,
            };
            if sender.send(ping).await.is_err() {
                debug!(target: "cdp-session", "heartbeat channel closed");
                break;
            }
            match timeout(deadline, resp_rx).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(target: "cdp-session", %err, "heartbeat command failed");
                    break;
                }
                Ok(Err(_)) => {
                    debug!(target: "cdp-session", "heartbeat response channel closed");
                    break;
                }
                Err(_) => {
                    warn!(target: "cdp-session", "heartbeat timed out");
                    break;
                }
            }
        }
        alive.store(false, Ordering::Relaxed);
    }))
}
