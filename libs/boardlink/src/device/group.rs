//! Readiness fan-in over a set of devices
//!
//! A group does not own its members; it holds their handles and follows the
//! device `Ready` events of the boards they live on. The aggregate flag only flips,
//! and only emits, when every member is ready or when that stops being true.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DeviceEvent, DeviceHandle};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    Ready(bool),
}

#[derive(Debug)]
struct GroupState {
    ready_count: usize,
    ready: bool,
}

#[derive(Debug)]
struct GroupInner {
    members: Vec<DeviceHandle>,
    state: Mutex<GroupState>,
    events: broadcast::Sender<GroupEvent>,
}

impl GroupInner {
    fn is_member(&self, device_id: u8, source: &DeviceHandle) -> bool {
        self.members
            .iter()
            .any(|m| m.id() == device_id && m.same_board(source))
    }

    fn on_member_ready(&self, device_id: u8, ready: bool) {
        let size = self.members.len();
        let flipped = {
            let mut state = self.state.lock();
            if ready {
                if state.ready_count >= size {
                    warn!(device_id, "Ready count would exceed group size, ignoring");
                    return;
                }
                state.ready_count += 1;
            } else {
                if state.ready_count == 0 {
                    warn!(device_id, "Ready count would go below zero, ignoring");
                    return;
                }
                state.ready_count -= 1;
            }

            let all_ready = size > 0 && state.ready_count == size;
            if all_ready == state.ready {
                None
            } else {
                state.ready = all_ready;
                Some(all_ready)
            }
        };

        if let Some(all_ready) = flipped {
            debug!(all_ready, "Device group readiness changed");
            let _ = self.events.send(GroupEvent::Ready(all_ready));
        }
    }
}

/// Aggregated readiness of a set of devices
#[derive(Debug)]
pub struct DeviceGroup {
    inner: Arc<GroupInner>,
    cancel: CancellationToken,
    watchers: Vec<JoinHandle<()>>,
}

impl DeviceGroup {
    /// Build the group and start following member readiness
    ///
    /// Must be called within a tokio runtime.
    pub fn new(members: Vec<DeviceHandle>) -> Self {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(GroupInner {
            members,
            state: Mutex::new(GroupState {
                ready_count: 0,
                ready: false,
            }),
            events,
        });

        // one watcher per distinct board, subscribed before the initial count
        let cancel = CancellationToken::new();
        let mut watchers = Vec::new();
        let mut sources: Vec<DeviceHandle> = Vec::new();
        for member in &inner.members {
            if sources.iter().any(|s| s.same_board(member)) {
                continue;
            }
            sources.push(member.clone());
            if let Ok(rx) = member.tap_device_events() {
                watchers.push(spawn_watcher(
                    inner.clone(),
                    member.clone(),
                    rx,
                    cancel.clone(),
                ));
            }
        }

        {
            let initial = inner.members.iter().filter(|m| m.is_ready()).count();
            let mut state = inner.state.lock();
            state.ready_count = initial;
            state.ready = !inner.members.is_empty() && initial == inner.members.len();
        }

        Self {
            inner,
            cancel,
            watchers,
        }
    }

    pub fn members(&self) -> &[DeviceHandle] {
        &self.inner.members
    }

    pub fn len(&self) -> usize {
        self.inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.members.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.inner.state.lock().ready_count
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.inner.events.subscribe()
    }

    /// Request status from every member
    ///
    /// All members are asked even if some fail; the first failure is returned.
    pub async fn request_status(&self) -> Result<()> {
        let mut first_error = None;
        for member in &self.inner.members {
            if let Err(e) = member.request_status().await {
                warn!(device_id = member.id(), "Group status request failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

fn spawn_watcher(
    inner: Arc<GroupInner>,
    source: DeviceHandle,
    mut rx: mpsc::UnboundedReceiver<(u8, DeviceEvent)>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (device_id, event) = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let DeviceEvent::Ready(ready) = event {
                if inner.is_member(device_id, &source) {
                    inner.on_member_ready(device_id, ready);
                }
            }
        }
    })
}
