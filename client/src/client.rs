// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use codec::{PacketId, QoS};

use crate::config::ClientConfig;
use crate::error::{Error, ErrorKind};
use crate::event::{Event, EventSink};
use crate::session::Session;
use crate::status::ClientStatus;

/// How long the worker loop sleeps between iterations while there is no
/// socket I/O to wait on: backing off during `WaitReconnect` (until the
/// reconnect deadline) and idling while `Disconnected` (until `stop` or
/// `reconnect` wakes it).
const WORKER_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

thread_local! {
    /// Set for the duration of an `on_event` callback invocation, so
    /// `Client::stop` can refuse to self-deadlock when called from inside
    /// one.
    static IN_EVENT_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

struct GuardedSink<S> {
    inner: S,
}

impl<S: EventSink> EventSink for GuardedSink<S> {
    fn on_event(&mut self, event: Event) {
        IN_EVENT_CALLBACK.with(|flag| flag.set(true));
        self.inner.on_event(event);
        IN_EVENT_CALLBACK.with(|flag| flag.set(false));
    }
}

/// The public, reentrant-safe MQTT client surface. One `Client` drives
/// exactly one worker task running the session state machine;
/// `publish`/`subscribe`/`unsubscribe`/`disconnect`/`reconnect` take a lock
/// shared with the worker and may be called concurrently from any task.
pub struct Client {
    inner: Arc<Mutex<Session>>,
    worker: Option<JoinHandle<()>>,
    stop_requested: Arc<AtomicBool>,
}

impl Client {
    /// Build a client from `config`; the worker is not started yet.
    ///
    /// # Errors
    ///
    /// Returns error if `config` fails cross-field validation.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Session::new(config))),
            worker: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the worker task, driving the session state machine and
    /// forwarding every emitted event to `sink`.
    ///
    /// # Errors
    ///
    /// Returns a `Lifecycle` error if `start` was already called.
    pub fn start<S>(&mut self, sink: S) -> Result<(), Error>
    where
        S: EventSink + 'static,
    {
        if self.worker.is_some() {
            return Err(Error::new(ErrorKind::Lifecycle, "start called on an already-started client"));
        }
        let inner = Arc::clone(&self.inner);
        let stop_requested = Arc::clone(&self.stop_requested);
        let mut sink = GuardedSink { inner: sink };
        self.worker = Some(tokio::spawn(async move {
            loop {
                if stop_requested.load(Ordering::Acquire) {
                    let mut session = inner.lock().await;
                    if session.status() != ClientStatus::Disconnected {
                        session.request_disconnect();
                        let _ = session.step(&mut sink).await;
                    }
                    break;
                }
                let mut session = inner.lock().await;
                let result = session.step(&mut sink).await;
                let status = session.status();
                drop(session);
                if result.is_err() {
                    break;
                }
                if matches!(status, ClientStatus::WaitReconnect | ClientStatus::Disconnected) {
                    tokio::time::sleep(WORKER_IDLE_POLL_INTERVAL).await;
                }
            }
        }));
        Ok(())
    }

    /// Signal the worker to disconnect and shut down, then wait for it.
    ///
    /// # Errors
    ///
    /// Returns a `Lifecycle` error when called from inside the event
    /// callback (would deadlock waiting on itself), or if the worker was
    /// never started.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if IN_EVENT_CALLBACK.with(std::cell::Cell::get) {
            return Err(Error::new(ErrorKind::Lifecycle, "stop called from inside the event callback"));
        }
        let worker = self
            .worker
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Lifecycle, "stop called before start"))?;
        self.stop_requested.store(true, Ordering::Release);
        let _ = worker.await;
        Ok(())
    }

    /// Request a clean disconnect without stopping the worker; honored by
    /// the session on its next loop iteration.
    pub async fn disconnect(&self) {
        self.inner.lock().await.request_disconnect();
    }

    /// Force an immediate reconnect attempt while in `WAIT_RECONNECT`.
    pub async fn reconnect(&self) {
        self.inner.lock().await.request_reconnect();
    }

    #[must_use]
    pub async fn status(&self) -> ClientStatus {
        self.inner.lock().await.status()
    }

    /// Enqueue a PUBLISH.
    ///
    /// # Errors
    ///
    /// See [`Session::publish`].
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<PacketId, Error> {
        self.inner.lock().await.publish(topic, payload, qos, retain)
    }

    /// Enqueue a SUBSCRIBE.
    ///
    /// # Errors
    ///
    /// See [`Session::subscribe`].
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<PacketId, Error> {
        self.inner.lock().await.subscribe(topic, qos)
    }

    /// Enqueue an UNSUBSCRIBE.
    ///
    /// # Errors
    ///
    /// See [`Session::unsubscribe`].
    pub async fn unsubscribe(&self, topic: &str) -> Result<PacketId, Error> {
        self.inner.lock().await.unsubscribe(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_twice_is_lifecycle_error() {
        let config = ClientConfig::new("mqtt://127.0.0.1:1").unwrap();
        let mut client = Client::new(config).unwrap();
        client.start(crate::event::FnSink(|_event: Event| {})).unwrap();
        let err = client.start(crate::event::FnSink(|_event: Event| {})).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Lifecycle));
        let _ = client.stop().await;
    }
}
