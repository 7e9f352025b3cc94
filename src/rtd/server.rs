use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::PollerSettings;
use crate::connection::ConnectionManager;
use crate::events::ConnectionState;
use crate::transport::BrokerTransport;
use crate::utils::BridgeError;

pub type CellId = i32;

pub const NOT_CONNECTED_STATUS: &str = "#NOT_CONNECTED!";
pub const ERROR_STATUS: &str = "#ERROR!";

/// What a cell displays after a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Value(String),
    /// No message for the topic yet, or the field is absent from it.
    Empty,
    NotConnected,
    Error,
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Value(v) => f.write_str(v),
            CellValue::Empty => Ok(()),
            CellValue::NotConnected => f.write_str(NOT_CONNECTED_STATUS),
            CellValue::Error => f.write_str(ERROR_STATUS),
        }
    }
}

/// The (topic, field) pair a cell is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellBinding {
    pub topic: String,
    pub field: String,
}

impl fmt::Display for CellBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellBinding[topic: {}, field: {}]", self.topic, self.field)
    }
}

/// Told on every poll tick that fresh values may be available.
pub trait UpdateNotifier: Send + Sync + 'static {
    fn update_notify(&self);
}

/// Host-facing adapter mapping polled cells onto broker topics.
///
/// Each cell holds one unit of demand on its topic in the subscription
/// registry, so a topic stays subscribed while any cell still reads it.
/// Cached values keep being served while the transport reconnects.
pub struct LiveDataServer<T: BrokerTransport> {
    connection: Arc<ConnectionManager<T>>,
    cells: Mutex<BTreeMap<CellId, CellBinding>>,
    /// Demand released by removed cells that the broker has not let go of yet.
    unreleased: Mutex<Vec<String>>,
    interval: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
    event_log: Mutex<Option<EventLog>>,
}

/// Task logging connection events until told to stop.
struct EventLog {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl<T: BrokerTransport> LiveDataServer<T> {
    pub fn new(connection: ConnectionManager<T>, poller: &PollerSettings) -> Self {
        Self {
            connection: Arc::new(connection),
            cells: Mutex::new(BTreeMap::new()),
            unreleased: Mutex::new(Vec::new()),
            interval: poller.interval(),
            timer: Mutex::new(None),
            event_log: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    /// Cells currently bound, ordered by id.
    pub fn cells(&self) -> Vec<(CellId, CellBinding)> {
        self.cells
            .lock()
            .iter()
            .map(|(id, binding)| (*id, binding.clone()))
            .collect()
    }

    /// Starts the update timer and the event log, then connects.
    ///
    /// Returns whether the broker connection is open.
    pub async fn start(&self, notifier: Arc<dyn UpdateNotifier>) -> bool {
        if self.is_serving() {
            info!("live data server already connected");
            return true;
        }

        {
            let mut event_log = self.event_log.lock();
            if event_log.is_none() {
                *event_log = Some(self.spawn_event_log());
            }
        }
        {
            let mut timer = self.timer.lock();
            if timer.is_none() {
                *timer = Some(spawn_update_timer(self.interval, notifier));
            }
        }

        match self.connection.connect().await {
            Ok(event) => {
                info!(%event, "live data server started");
                true
            }
            Err(e) => {
                error!(error = %e, "live data server failed to connect");
                false
            }
        }
    }

    fn spawn_event_log(&self) -> EventLog {
        let mut events = self.connection.register_connection_event_observer();
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => info!("{event}"),
                        None => break,
                    },
                    _ = &mut stopped => {
                        while let Ok(event) = events.try_recv() {
                            info!("{event}");
                        }
                        break;
                    }
                }
            }
        });
        EventLog { stop, task }
    }

    /// Binds `cell_id` to (`topic`, `field`) and returns its current value.
    pub async fn connect_data(&self, cell_id: CellId, topic: &str, field: &str) -> CellValue {
        if topic.trim().is_empty() || field.trim().is_empty() {
            error!(cell_id, "topic or field name missing for cell");
            return CellValue::Error;
        }
        let binding = CellBinding {
            topic: topic.to_string(),
            field: field.to_string(),
        };

        let existing = {
            let mut cells = self.cells.lock();
            match cells.get(&cell_id) {
                Some(existing) => Some(existing.clone()),
                None => {
                    debug!(cell_id, %binding, "adding cell");
                    cells.insert(cell_id, binding.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            // already holds demand on its topic
            return self.read(&existing);
        }

        match self.connection.retain(&binding.topic).await {
            Ok(true) => {
                info!(%binding, "subscription added");
                self.read(&binding)
            }
            Ok(false) => {
                error!(%binding, "failed to add subscription");
                CellValue::Error
            }
            Err(BridgeError::NotConnected) => {
                trace!(%binding, "not connected to a broker");
                CellValue::NotConnected
            }
            Err(e) => {
                error!(%binding, error = %e, "subscribe failed");
                CellValue::Error
            }
        }
    }

    /// Current value of every cell, subscribing first to any topic the
    /// registry lost (rejected earlier, or dropped with a session) and
    /// retrying releases the broker refused.
    pub async fn refresh_data(&self) -> Vec<(CellId, CellValue)> {
        let cells = self.cells();

        if self.connection.is_connected() {
            let missing: BTreeSet<&str> = cells
                .iter()
                .map(|(_, binding)| binding.topic.as_str())
                .filter(|topic| !self.connection.registry().contains(topic))
                .collect();
            let attempts = missing.into_iter().map(|topic| async move {
                match self.connection.subscribe(topic).await {
                    Ok(true) => info!(%topic, "subscription restored"),
                    Ok(false) => warn!(%topic, "subscription still rejected"),
                    Err(e) => warn!(%topic, error = %e, "subscription restore failed"),
                }
            });
            join_all(attempts).await;

            let unreleased = std::mem::take(&mut *self.unreleased.lock());
            for topic in unreleased {
                self.release(topic).await;
            }
        }

        cells
            .iter()
            .map(|(id, binding)| (*id, self.read(binding)))
            .collect()
    }

    /// Forgets `cell_id` and gives up its demand on the topic.
    pub async fn disconnect_data(&self, cell_id: CellId) {
        let Some(binding) = self.cells.lock().remove(&cell_id) else {
            return;
        };
        debug!(cell_id, %binding, "removing cell");
        self.release(binding.topic).await;
    }

    async fn release(&self, topic: String) {
        match self.connection.release(&topic).await {
            Ok(true) => debug!(%topic, "demand released"),
            Ok(false) => {
                error!(%topic, "failed to remove subscription");
                self.unreleased.lock().push(topic);
            }
            Err(e) => {
                error!(%topic, error = %e, "unsubscribe failed");
                self.unreleased.lock().push(topic);
            }
        }
    }

    pub fn heartbeat(&self) -> bool {
        true
    }

    /// Stops the timer and disconnects from the broker. The event log
    /// stays up until the teardown events are recorded.
    pub async fn terminate(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        match self.connection.disconnect().await {
            Ok(()) => {
                self.connection.cache().clear();
                info!("live data server stopped");
            }
            Err(e) => error!(error = %e, "disconnect failed during terminate"),
        }
        let event_log = self.event_log.lock().take();
        if let Some(EventLog { stop, task }) = event_log {
            let _ = stop.send(());
            let _ = task.await;
        }
    }

    /// Opened, or riding out a transport reconnect.
    fn is_serving(&self) -> bool {
        matches!(
            self.connection.state(),
            ConnectionState::Opened | ConnectionState::Reconnecting | ConnectionState::Reconnected
        )
    }

    fn read(&self, binding: &CellBinding) -> CellValue {
        if !self.is_serving() {
            return CellValue::NotConnected;
        }
        self.connection
            .lookup(&binding.topic)
            .and_then(|message| message.field(&binding.field))
            .map(CellValue::Value)
            .unwrap_or(CellValue::Empty)
    }
}

fn spawn_update_timer(period: Duration, notifier: Arc<dyn UpdateNotifier>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            notifier.update_notify();
        }
    })
}
