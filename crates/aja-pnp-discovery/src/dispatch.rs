//! Notification delivery
//!
//! In inline mode observers run on whichever thread changed the registry. In
//! queued mode notices go through a bounded queue to one dispatch thread, so
//! observers never run on a platform callback thread and always see events in
//! the order the registry applied them.

use aja_pnp_core::{DeviceEvent, DeviceHandle};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::DispatchMode;
use crate::notify::NotificationRegistry;

/// One registry change, as published on the event channel
#[derive(Debug, Clone)]
pub struct DeviceNotice {
    pub event: DeviceEvent,
    pub device: DeviceHandle,
}

enum Envelope {
    Notice(DeviceNotice),
    Flush(SyncSender<()>),
}

struct Queue {
    tx: Mutex<Option<SyncSender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

pub(crate) struct Dispatcher {
    notifications: Arc<NotificationRegistry>,
    events: broadcast::Sender<DeviceNotice>,
    queue: Option<Queue>,
}

impl Dispatcher {
    pub(crate) fn new(
        mode: DispatchMode,
        queue_capacity: usize,
        notifications: Arc<NotificationRegistry>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let queue = match mode {
            DispatchMode::Inline => None,
            DispatchMode::Queued => {
                match spawn_worker(queue_capacity.max(1), notifications.clone(), events.clone()) {
                    Ok(queue) => Some(queue),
                    Err(e) => {
                        warn!(error = %e, "Failed to start dispatch thread, delivering inline");
                        None
                    }
                }
            }
        };
        Self {
            notifications,
            events,
            queue,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeviceNotice> {
        self.events.subscribe()
    }

    pub(crate) fn dispatch(&self, event: DeviceEvent, device: &DeviceHandle) {
        let notice = DeviceNotice {
            event,
            device: device.clone(),
        };
        let Some(queue) = &self.queue else {
            deliver(&self.notifications, &self.events, notice);
            return;
        };

        let Some(tx) = lock(&queue.tx).clone() else {
            debug!(%event, device = %device, "Dispatcher closed, dropping notice");
            return;
        };
        match tx.try_send(Envelope::Notice(notice)) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                if thread::current().id() == queue.worker_id {
                    // An observer changed the registry; waiting on our own queue would never return
                    if let Envelope::Notice(notice) = envelope {
                        deliver(&self.notifications, &self.events, notice);
                    }
                    return;
                }
                debug!("Dispatch queue full, waiting for space");
                if tx.send(envelope).is_err() {
                    debug!("Dispatcher closed while waiting");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(%event, "Dispatcher closed, dropping notice");
            }
        }
    }

    /// Block until every notice queued before this call has been delivered.
    /// Returns immediately in inline mode and on the dispatch thread itself.
    pub(crate) fn flush(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        if thread::current().id() == queue.worker_id {
            return;
        }
        let Some(tx) = lock(&queue.tx).clone() else {
            return;
        };
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        if tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Stop accepting notices, deliver what is queued, and join the dispatch thread.
    pub(crate) fn close(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        drop(lock(&queue.tx).take());
        if thread::current().id() == queue.worker_id {
            return;
        }
        if let Some(worker) = lock(&queue.worker).take() {
            if worker.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_worker(
    capacity: usize,
    notifications: Arc<NotificationRegistry>,
    events: broadcast::Sender<DeviceNotice>,
) -> std::io::Result<Queue> {
    let (tx, rx) = mpsc::sync_channel::<Envelope>(capacity);
    let worker = thread::Builder::new()
        .name("aja-pnp-dispatch".into())
        .spawn(move || {
            debug!("Dispatch thread started");
            run_worker(rx, &notifications, &events);
            debug!("Dispatch thread stopped");
        })?;
    info!(capacity, "Queued notification dispatch enabled");
    Ok(Queue {
        tx: Mutex::new(Some(tx)),
        worker_id: worker.thread().id(),
        worker: Mutex::new(Some(worker)),
    })
}

fn run_worker(
    rx: Receiver<Envelope>,
    notifications: &NotificationRegistry,
    events: &broadcast::Sender<DeviceNotice>,
) {
    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Notice(notice) => deliver(notifications, events, notice),
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn deliver(
    notifications: &NotificationRegistry,
    events: &broadcast::Sender<DeviceNotice>,
    notice: DeviceNotice,
) {
    notifications.notify_all(notice.event, &notice.device);
    // No receivers is normal
    let _ = events.send(notice);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
