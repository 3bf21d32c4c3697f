//! Hotplug event consumer
//!
//! Feeds arrivals and removals from the USB thread into the
//! [`BindingLifecycle`]. Binding happens inline so events for one handle are
//! applied in order; the helper itself runs on the blocking pool.

use crate::binding::{AttachOutcome, BindingLifecycle, BindingTicket};
use common::{DeviceDescriptor, DeviceHandle, HotplugBridge, HotplugEvent};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Controller {
    lifecycle: Arc<BindingLifecycle>,
    bridge: HotplugBridge,
    shutdown: CancellationToken,
    dispatches: JoinSet<()>,
}

impl Controller {
    pub fn new(
        lifecycle: Arc<BindingLifecycle>,
        bridge: HotplugBridge,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            lifecycle,
            bridge,
            shutdown,
            dispatches: JoinSet::new(),
        }
    }

    /// Consume events until shutdown or until the USB thread goes away
    pub async fn run(mut self) {
        info!("Controller started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Controller received shutdown");
                    break;
                }
                event = self.bridge.recv_event() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        warn!("Hotplug source closed: {}", e);
                        break;
                    }
                },
                Some(joined) = self.dispatches.join_next(), if !self.dispatches.is_empty() => {
                    if let Err(e) = joined {
                        error!("Dispatch task failed: {}", e);
                    }
                }
            }
        }

        let torn = self.lifecycle.shutdown();
        if !torn.is_empty() {
            info!("Tore down {} binding(s) on shutdown", torn.len());
        }
        while let Some(joined) = self.dispatches.join_next().await {
            if let Err(e) = joined {
                error!("Dispatch task failed: {}", e);
            }
        }

        info!("Controller stopped");
    }

    fn handle_event(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Arrived { handle, device } => self.handle_arrived(handle, device),
            HotplugEvent::Left { handle } => {
                // Failures are logged by the lifecycle and not propagated.
                if let Err(e) = self.lifecycle.detach(&handle) {
                    debug!("Detach of {} reported {}", handle, e.errno());
                }
            }
        }
    }

    fn handle_arrived(&mut self, handle: DeviceHandle, device: DeviceDescriptor) {
        let ticket = match self.lifecycle.bind(handle.clone(), device) {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return,
            Err(e) => {
                warn!("Attach of {} rejected: {} ({})", handle, e, e.errno());
                return;
            }
        };

        if ticket.needs_dispatch() {
            let lifecycle = Arc::clone(&self.lifecycle);
            self.dispatches
                .spawn_blocking(move || finish_attach(&lifecycle, ticket));
        } else {
            finish_attach(&self.lifecycle, ticket);
        }
    }
}

fn finish_attach(lifecycle: &BindingLifecycle, ticket: BindingTicket) {
    let handle = ticket.handle().clone();
    match lifecycle.dispatch(ticket) {
        Ok(AttachOutcome::Bound(id)) => {
            info!("{} bound as {} without unlocking", handle, id);
        }
        Ok(AttachOutcome::Dispatched(id)) => {
            info!("{} unlocked (binding {})", handle, id);
        }
        Ok(AttachOutcome::Orphaned(id)) => {
            warn!("{} left before binding {} finished unlocking", handle, id);
        }
        Ok(AttachOutcome::Ignored) => {}
        Err(e) => {
            warn!("Attach of {} failed: {} ({})", handle, e, e.errno());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingState;
    use crate::config::Mode;
    use crate::dispatcher::{DispatchError, DispatchRequest, Dispatcher};
    use crate::matcher::TargetIdentity;
    use crate::secret::SecretMaterial;
    use common::create_hotplug_bridge;
    use common::test_utils::{mock_descriptor, mock_handle};
    use std::path::PathBuf;
    use std::time::Duration;

    struct NoopDispatcher;

    impl Dispatcher for NoopDispatcher {
        fn dispatch(&self, _request: DispatchRequest) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_arrival_and_removal() {
        let token = CancellationToken::new();
        let lifecycle = Arc::new(BindingLifecycle::new(
            Mode::Enforcement {
                target: TargetIdentity::from_device(&mock_descriptor(0x1234)),
                folder: PathBuf::from("/srv/vault"),
            },
            SecretMaterial::builtin(),
            Arc::new(NoopDispatcher),
            token.clone(),
        ));
        let (bridge, source) = create_hotplug_bridge();
        let task = tokio::spawn(Controller::new(lifecycle.clone(), bridge, token.clone()).run());

        source
            .send_event(HotplugEvent::Arrived {
                handle: mock_handle(2),
                device: mock_descriptor(0x1234),
            })
            .unwrap();
        wait_for(|| lifecycle.state_of(&mock_handle(2)) == Some(BindingState::Dispatched)).await;

        // Unknown handle is swallowed; the controller keeps running.
        source
            .send_event(HotplugEvent::Left {
                handle: mock_handle(9),
            })
            .unwrap();
        source
            .send_event(HotplugEvent::Left {
                handle: mock_handle(2),
            })
            .unwrap();
        wait_for(|| lifecycle.active_count() == 0).await;
        assert!(lifecycle.is_gate_available());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_bindings() {
        let token = CancellationToken::new();
        let lifecycle = Arc::new(BindingLifecycle::new(
            Mode::Discovery { vendor_id: 0x1234 },
            SecretMaterial::builtin(),
            Arc::new(NoopDispatcher),
            token.clone(),
        ));
        let (bridge, source) = create_hotplug_bridge();
        let task = tokio::spawn(Controller::new(lifecycle.clone(), bridge, token.clone()).run());

        source
            .send_event(HotplugEvent::Arrived {
                handle: mock_handle(2),
                device: mock_descriptor(0x1234),
            })
            .unwrap();
        wait_for(|| lifecycle.active_count() == 1).await;

        token.cancel();
        task.await.unwrap();
        assert_eq!(lifecycle.active_count(), 0);
        assert!(lifecycle.is_gate_available());
    }
}
