//! Long-lived container event monitoring.
//!
//! One monitor owns at most one `events` subprocess. The subprocess emits
//! newline-delimited JSON; each line is parsed independently, mapped to a
//! typed [`ContainerEvent`], correlated to a task by stripping the managed
//! name prefix, and re-emitted on a bounded broadcast channel. A malformed
//! line is logged and skipped; it never terminates the stream.

use crate::command::EventsCommand;
use crate::detector::RuntimeKind;
use crate::error::RuntimeError;
use crate::process::terminate_with_grace;
use dockyard_core::{
    ContainerEvent, ContainerEventData, ContainerEventKind, ContainerId, MonitorConfig, TaskId,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit code the kernel reports for a memory-limit kill.
const OOM_EXIT_CODE: i64 = 137;

/// Bound of the re-emit channel; lagging subscribers lose oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bound of the per-session terminal-container set. Oldest entries are
/// evicted first, so a very long session stays at constant memory at the
/// cost of no longer deduplicating replays of its oldest containers.
const CLOSED_SESSION_CAPACITY: usize = 4096;

/// Raw engine event record, one per stdout line.
///
/// Field names follow the engine's JSON (`docker events --format
/// '{{json .}}'`); podman emits a compatible shape.
#[derive(Debug, Deserialize)]
struct EngineEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<EngineActor>,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EngineActor {
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Stateful per-session mapper from raw lines to domain events.
///
/// Tracks containers whose lifecycle already ended so a terminal
/// `died`/`removed` event is never followed by more events for the same
/// container id within one monitoring session.
struct EventMapper {
    name_prefix: String,
    closed: HashSet<String>,
    closed_order: VecDeque<String>,
}

impl EventMapper {
    fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            closed: HashSet::new(),
            closed_order: VecDeque::new(),
        }
    }

    /// Record a terminal container, evicting the oldest entry once the
    /// session bound is reached.
    fn mark_closed(&mut self, container_id: &str) {
        if !self.closed.insert(container_id.to_string()) {
            return;
        }
        self.closed_order.push_back(container_id.to_string());
        if self.closed_order.len() > CLOSED_SESSION_CAPACITY {
            if let Some(evicted) = self.closed_order.pop_front() {
                self.closed.remove(&evicted);
            }
        }
    }

    /// Parse one stdout line. Malformed input yields `None` after a
    /// warning; valid lines for already-closed containers are dropped.
    fn handle_line(&mut self, line: &str) -> Option<ContainerEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let raw: EngineEvent = match serde_json::from_str(trimmed) {
            Ok(raw) => raw,
            Err(err) => {
                let preview: String = trimmed.chars().take(120).collect();
                warn!(error = %err, preview = %preview, "Skipping malformed engine event");
                return None;
            }
        };

        let event = self.map_event(&raw)?;

        if self.closed.contains(event.container_id.as_str()) {
            debug!(
                container_id = %event.container_id,
                "Dropping event after terminal lifecycle event"
            );
            return None;
        }
        if event.is_terminal() {
            self.mark_closed(event.container_id.as_str());
        }
        Some(event)
    }

    fn map_event(&self, raw: &EngineEvent) -> Option<ContainerEvent> {
        let action = raw
            .action
            .as_deref()
            .or(raw.status.as_deref())?
            .to_string();

        let attributes = raw
            .actor
            .as_ref()
            .map(|actor| &actor.attributes);
        let name = attributes
            .and_then(|attrs| attrs.get("name"))
            .cloned()
            .unwrap_or_default();
        let container_id = raw
            .id
            .clone()
            .or_else(|| raw.actor.as_ref().and_then(|actor| actor.id.clone()))?;

        // Managed containers are `<prefix>-<task id>`; anything else is
        // emitted without a task correlation.
        let task_id = name
            .strip_prefix(&format!("{}-", self.name_prefix))
            .map(TaskId::new);

        let (kind, data) = match action.as_str() {
            "create" => (
                ContainerEventKind::Created,
                ContainerEventData::Created {
                    image: attributes.and_then(|attrs| attrs.get("image")).cloned(),
                },
            ),
            "start" => (ContainerEventKind::Started, ContainerEventData::Started {}),
            "stop" => (
                ContainerEventKind::Stopped,
                ContainerEventData::Stopped {
                    exit_code: attributes
                        .and_then(|attrs| attrs.get("exitCode"))
                        .and_then(|code| code.parse().ok()),
                },
            ),
            "die" => {
                let exit_code: Option<i64> = attributes
                    .and_then(|attrs| attrs.get("exitCode"))
                    .and_then(|code| code.parse().ok());
                let oom_attribute = attributes
                    .and_then(|attrs| attrs.get("oomKilled"))
                    .is_some_and(|flag| flag == "true");
                let oom_killed = oom_attribute || exit_code == Some(OOM_EXIT_CODE);
                let signal = if oom_killed {
                    Some("SIGKILL".to_string())
                } else {
                    attributes.and_then(|attrs| attrs.get("signal")).cloned()
                };
                (
                    ContainerEventKind::Died,
                    ContainerEventData::Died {
                        exit_code,
                        oom_killed,
                        signal,
                    },
                )
            }
            "destroy" | "remove" => {
                (ContainerEventKind::Removed, ContainerEventData::Removed {})
            }
            other if other.starts_with("health_status") => (
                ContainerEventKind::Health,
                ContainerEventData::Health {
                    health_status: other.split(": ").nth(1).map(str::to_string),
                },
            ),
            other => {
                debug!(action = %other, "Ignoring unmapped engine action");
                return None;
            }
        };

        let timestamp = raw
            .time
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(chrono::Utc::now);

        Some(ContainerEvent {
            kind,
            task_id,
            container_id: ContainerId::new(container_id),
            container_name: name,
            timestamp,
            data,
        })
    }
}

struct RunningMonitor {
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

/// Streams the engine's event feed and re-emits typed lifecycle events.
///
/// State machine: idle -> running -> stopping -> idle. Start while running
/// is a no-op; stop while idle resolves without error.
pub struct ContainerLifecycleMonitor {
    engine: RuntimeKind,
    config: MonitorConfig,
    events_tx: broadcast::Sender<ContainerEvent>,
    running: Mutex<Option<RunningMonitor>>,
    active: Arc<AtomicBool>,
}

impl ContainerLifecycleMonitor {
    /// Create a monitor for the given engine.
    pub fn new(engine: RuntimeKind, config: MonitorConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine,
            config,
            events_tx,
            running: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the re-emitted lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events_tx.subscribe()
    }

    /// True while the event subprocess is owned and being read.
    pub fn is_events_monitoring_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the long-lived event stream subprocess.
    ///
    /// Idempotent: calling start while already active does nothing.
    pub async fn start_events_monitoring(&self) -> Result<(), RuntimeError> {
        let mut running = self.running.lock().await;
        if let Some(session) = running.take() {
            if self.active.load(Ordering::SeqCst) {
                debug!("Event monitoring already active; start is a no-op");
                *running = Some(session);
                return Ok(());
            }
            // The previous stream died on its own; reap it and restart.
            session.cancel.cancel();
            if let Err(err) = session.reader.await {
                warn!(error = %err, "Previous event reader did not join cleanly");
            }
        }

        let args = EventsCommand::new()
            .with_kinds(self.config.event_kinds.iter().cloned())
            .with_name_prefix(&self.config.container_name_prefix)
            .to_args();

        info!(engine = %self.engine, ?args, "Starting container event monitoring");

        let mut child = tokio::process::Command::new(self.engine.binary())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::TaskJoin("event subprocess produced no stdout handle".to_string())
        })?;

        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let events_tx = self.events_tx.clone();
        let active = Arc::clone(&self.active);
        let prefix = self.config.container_name_prefix.clone();
        let grace = self.config.stop_grace_period;

        active.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(async move {
            let mut mapper = EventMapper::new(prefix);
            let mut lines = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                tokio::select! {
                    _ = reader_cancel.cancelled() => {
                        debug!("Event monitoring stop requested");
                        break;
                    }
                    read = lines.read_line(&mut line) => match read {
                        Ok(0) => {
                            warn!("Engine event stream closed (EOF)");
                            break;
                        }
                        Ok(_) => {
                            if let Some(event) = mapper.handle_line(&line) {
                                // Send only fails with zero subscribers.
                                let _ = events_tx.send(event);
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "Error reading engine event stream");
                            break;
                        }
                    }
                }
            }

            if reader_cancel.is_cancelled() {
                if let Err(err) = terminate_with_grace(&mut child, grace).await {
                    warn!(error = %err, "Failed to reap event subprocess");
                }
            } else {
                // Stream ended on its own (process error or exit).
                match child.wait().await {
                    Ok(status) => {
                        warn!(?status, "Event subprocess exited unexpectedly");
                    }
                    Err(err) => {
                        error!(error = %err, "Event subprocess wait failed");
                    }
                }
            }
            active.store(false, Ordering::SeqCst);
        });

        *running = Some(RunningMonitor { cancel, reader });
        Ok(())
    }

    /// Stop the event stream: graceful signal, bounded grace, then kill.
    ///
    /// Idempotent: stopping an already-stopped monitor resolves cleanly.
    pub async fn stop_events_monitoring(&self) {
        let running = {
            let mut guard = self.running.lock().await;
            guard.take()
        };

        let Some(RunningMonitor { cancel, reader }) = running else {
            debug!("Event monitoring already stopped");
            return;
        };

        cancel.cancel();
        if let Err(err) = reader.await {
            warn!(error = %err, "Event reader task did not join cleanly");
        }
        self.active.store(false, Ordering::SeqCst);
        info!("Container event monitoring stopped");
    }
}
