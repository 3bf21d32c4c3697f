//! Attach/detach state machine
//!
//! A [`Binding`] is the live state of one admitted device. Bindings are owned
//! by [`BindingLifecycle`] in a map keyed by [`DeviceHandle`] and each one
//! carries the gate permit, so removing a binding from the map is what
//! releases the gate.
//!
//! Attach is split in two steps. [`BindingLifecycle::bind`] is quick and
//! inserts the binding; [`BindingLifecycle::dispatch`] may block on the
//! helper. The dispatch result is applied only if the same binding (same
//! handle, same [`BindingId`]) is still present and `Bound`.

use crate::config::Mode;
use crate::dispatcher::{DispatchError, DispatchMode, DispatchRequest, Dispatcher};
use crate::gate::{AdmissionError, ExclusivityGate, GatePermit};
use crate::matcher::{TargetIdentity, matches};
use crate::secret::SecretMaterial;
use common::{DeviceDescriptor, DeviceHandle, Errno};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Generation number distinguishing successive bindings of the same handle
pub type BindingId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Bound,
    Dispatched,
    TornDown,
}

/// Live state of one admitted attachment
#[derive(Debug)]
pub struct Binding {
    id: BindingId,
    handle: DeviceHandle,
    key: SecretMaterial,
    identity: TargetIdentity,
    device: DeviceDescriptor,
    state: BindingState,
    _permit: GatePermit,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("binding {0} was already dispatched")]
pub struct AlreadyDispatched(pub BindingId);

impl Binding {
    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn key(&self) -> &SecretMaterial {
        &self.key
    }

    fn mark_dispatched(&mut self) -> Result<(), AlreadyDispatched> {
        match self.state {
            BindingState::Bound => {
                self.state = BindingState::Dispatched;
                Ok(())
            }
            _ => Err(AlreadyDispatched(self.id)),
        }
    }
}

/// Result of a successful attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Not our device; nothing was bound
    Ignored,
    /// Bound without dispatch (discovery mode)
    Bound(BindingId),
    /// Bound and the helper ran successfully
    Dispatched(BindingId),
    /// The helper finished after the binding was torn down
    Orphaned(BindingId),
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Busy(#[from] AdmissionError),

    #[error("device is already bound")]
    AlreadyBound,

    #[error("cannot allocate binding state")]
    OutOfMemory,

    #[error("{source}")]
    Dispatch {
        #[source]
        source: DispatchError,
        /// Whether the binding was torn down because of this failure
        torn_down: bool,
    },
}

impl AttachError {
    /// Error code reported to the host for a rejected attach
    pub fn errno(&self) -> Errno {
        match self {
            Self::Busy(_) => Errno::EBUSY,
            Self::AlreadyBound => Errno::EAGAIN,
            Self::OutOfMemory => Errno::ENOMEM,
            Self::Dispatch { .. } => Errno::ENOEXEC,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetachError {
    #[error("no binding found for {0}")]
    NoBinding(DeviceHandle),
}

impl DetachError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::NoBinding(_) => Errno::ENODATA,
        }
    }
}

/// Summary of a binding that has been torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TornDown {
    pub id: BindingId,
    /// State the binding was in when it was removed
    pub previous: BindingState,
}

/// A binding that was inserted and may still need its helper run
#[derive(Debug)]
pub struct BindingTicket {
    id: BindingId,
    handle: DeviceHandle,
    request: Option<DispatchRequest>,
}

impl BindingTicket {
    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Whether [`BindingLifecycle::dispatch`] will invoke the helper
    pub fn needs_dispatch(&self) -> bool {
        self.request.is_some()
    }
}

pub struct BindingLifecycle {
    mode: Mode,
    key: SecretMaterial,
    gate: ExclusivityGate,
    dispatcher: Arc<dyn Dispatcher>,
    bindings: Mutex<HashMap<DeviceHandle, Binding>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl BindingLifecycle {
    /// `shutdown` is the token the dispatcher observes; cancelling it kills an
    /// in-flight helper.
    pub fn new(
        mode: Mode,
        key: SecretMaterial,
        dispatcher: Arc<dyn Dispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            mode,
            key,
            gate: ExclusivityGate::new(),
            dispatcher,
            bindings: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<DeviceHandle, Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit, match and insert a binding for `handle`
    ///
    /// Returns `Ok(None)` when the device is not the configured target.
    pub fn bind(
        &self,
        handle: DeviceHandle,
        device: DeviceDescriptor,
    ) -> Result<Option<BindingTicket>, AttachError> {
        let permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                warn!("rejecting {} ({}): {}", handle, device, e);
                return Err(e.into());
            }
        };

        let (identity, request) = match &self.mode {
            Mode::Discovery { vendor_id } => {
                debug!("discovery mode, accepting {} without matching", device);
                (TargetIdentity::vendor(*vendor_id), None)
            }
            Mode::Enforcement { target, folder } => {
                if !matches(&device, target) {
                    info!("ignoring {} at {}: identity does not match", device, handle);
                    return Ok(None);
                }
                let request = DispatchRequest {
                    target_path: folder.clone(),
                    key: self.key.clone(),
                    mode: DispatchMode::Decrypt,
                };
                (target.clone(), Some(request))
            }
        };

        let mut bindings = self.bindings();
        if bindings.contains_key(&handle) {
            error!("{} is already bound", handle);
            return Err(AttachError::AlreadyBound);
        }
        if bindings.try_reserve(1).is_err() {
            error!("out of memory binding {}", handle);
            return Err(AttachError::OutOfMemory);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        bindings.insert(
            handle.clone(),
            Binding {
                id,
                handle: handle.clone(),
                key: self.key.clone(),
                identity,
                device,
                state: BindingState::Bound,
                _permit: permit,
            },
        );
        info!("bound {} as binding {}", handle, id);

        Ok(Some(BindingTicket {
            id,
            handle,
            request,
        }))
    }

    /// Run the helper for a freshly bound device and record the result
    pub fn dispatch(&self, ticket: BindingTicket) -> Result<AttachOutcome, AttachError> {
        let BindingTicket {
            id,
            handle,
            request,
        } = ticket;

        let Some(request) = request else {
            return Ok(AttachOutcome::Bound(id));
        };

        let result = self.dispatcher.dispatch(request);

        let mut bindings = self.bindings();
        let current = bindings
            .get_mut(&handle)
            .filter(|b| b.id == id && b.state == BindingState::Bound);

        match (result, current) {
            (Ok(()), Some(binding)) => match binding.mark_dispatched() {
                Ok(()) => {
                    info!("binding {} dispatched", id);
                    Ok(AttachOutcome::Dispatched(id))
                }
                Err(e) => {
                    error!("{}", e);
                    Ok(AttachOutcome::Orphaned(id))
                }
            },
            (Ok(()), None) => {
                warn!(
                    "helper finished after binding {} was torn down, discarding result",
                    id
                );
                Ok(AttachOutcome::Orphaned(id))
            }
            (Err(source), current) => {
                let torn_down = if source.is_fatal() && current.is_some() {
                    if let Some(mut binding) = bindings.remove(&handle) {
                        binding.state = BindingState::TornDown;
                    }
                    true
                } else {
                    false
                };
                error!(
                    "dispatch for binding {} failed: {}{}",
                    id,
                    source,
                    if torn_down { ", binding torn down" } else { "" }
                );
                Err(AttachError::Dispatch { source, torn_down })
            }
        }
    }

    /// Full attach: bind then dispatch on the calling thread
    pub fn attach(
        &self,
        handle: DeviceHandle,
        device: DeviceDescriptor,
    ) -> Result<AttachOutcome, AttachError> {
        match self.bind(handle, device)? {
            Some(ticket) => self.dispatch(ticket),
            None => Ok(AttachOutcome::Ignored),
        }
    }

    /// Tear down the binding for `handle` and release the gate
    ///
    /// An unknown handle is reported and leaves all state untouched.
    pub fn detach(&self, handle: &DeviceHandle) -> Result<TornDown, DetachError> {
        let removed = self.bindings().remove(handle);
        let Some(mut binding) = removed else {
            error!("no binding found for {}", handle);
            return Err(DetachError::NoBinding(handle.clone()));
        };

        let previous = binding.state;
        binding.state = BindingState::TornDown;
        info!("binding {} for {} torn down", binding.id, handle);

        Ok(TornDown {
            id: binding.id,
            previous,
        })
    }

    pub fn state_of(&self, handle: &DeviceHandle) -> Option<BindingState> {
        self.bindings().get(handle).map(|b| b.state)
    }

    /// Descriptor of the currently bound device, if any
    pub fn active_device(&self) -> Option<DeviceDescriptor> {
        self.bindings().values().next().map(|b| b.device.clone())
    }

    pub fn active_count(&self) -> usize {
        self.bindings().len()
    }

    pub fn is_gate_available(&self) -> bool {
        self.gate.is_available()
    }

    /// Cancel any running helper and tear down every binding
    pub fn shutdown(&self) -> Vec<TornDown> {
        self.shutdown.cancel();
        let drained: Vec<Binding> = self.bindings().drain().map(|(_, b)| b).collect();
        drained
            .into_iter()
            .map(|mut binding| {
                let previous = binding.state;
                binding.state = BindingState::TornDown;
                info!("binding {} torn down on shutdown", binding.id);
                TornDown {
                    id: binding.id,
                    previous,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Interruption;
    use common::test_utils::{mock_descriptor, mock_descriptor_with, mock_handle};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingDispatcher {
        calls: AtomicUsize,
        fail_with: Mutex<Option<fn() -> DispatchError>>,
    }

    impl Dispatcher for CountingDispatcher {
        fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
            assert_eq!(request.mode, DispatchMode::Decrypt);
            self.calls.fetch_add(1, Ordering::SeqCst);
            match *self.fail_with.lock().unwrap() {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn helper_failed() -> DispatchError {
        DispatchError::HelperFailed {
            code: Some(1),
            signal: None,
        }
    }

    fn cancelled() -> DispatchError {
        DispatchError::Interrupted(Interruption::Cancelled)
    }

    fn target() -> TargetIdentity {
        TargetIdentity::from_device(&mock_descriptor(0x1234))
    }

    fn enforcing(dispatcher: Arc<CountingDispatcher>) -> BindingLifecycle {
        BindingLifecycle::new(
            Mode::Enforcement {
                target: target(),
                folder: PathBuf::from("/srv/vault"),
            },
            SecretMaterial::builtin(),
            dispatcher,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_discovery_binds_without_dispatch() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let lifecycle = BindingLifecycle::new(
            Mode::Discovery { vendor_id: 0x1234 },
            SecretMaterial::builtin(),
            dispatcher.clone(),
            CancellationToken::new(),
        );

        let device = mock_descriptor_with(0x1234, "Anything", "Anyone", "ANY");
        let outcome = lifecycle.attach(mock_handle(2), device.clone()).unwrap();
        assert!(matches!(outcome, AttachOutcome::Bound(_)));
        assert_eq!(lifecycle.state_of(&mock_handle(2)), Some(BindingState::Bound));
        assert_eq!(lifecycle.active_device(), Some(device));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enforcement_dispatches_once() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let lifecycle = enforcing(dispatcher.clone());

        let outcome = lifecycle
            .attach(mock_handle(2), mock_descriptor(0x1234))
            .unwrap();
        assert!(matches!(outcome, AttachOutcome::Dispatched(_)));
        assert_eq!(
            lifecycle.state_of(&mock_handle(2)),
            Some(BindingState::Dispatched)
        );
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mismatch_is_ignored_and_releases_gate() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let lifecycle = enforcing(dispatcher.clone());

        let stranger = mock_descriptor_with(0x1234, "Test Key", "Test Manufacturer", "XYZ999");
        let outcome = lifecycle.attach(mock_handle(3), stranger).unwrap();
        assert_eq!(outcome, AttachOutcome::Ignored);
        assert_eq!(lifecycle.active_count(), 0);
        assert!(lifecycle.is_gate_available());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_second_attach_is_busy() {
        let lifecycle = enforcing(Arc::new(CountingDispatcher::default()));
        lifecycle
            .attach(mock_handle(2), mock_descriptor(0x1234))
            .unwrap();

        let err = lifecycle
            .attach(mock_handle(4), mock_descriptor(0x1234))
            .unwrap_err();
        assert!(matches!(err, AttachError::Busy(_)));
        assert_eq!(err.errno(), Errno::EBUSY);
        assert_eq!(lifecycle.active_count(), 1);
        assert_eq!(
            lifecycle.state_of(&mock_handle(2)),
            Some(BindingState::Dispatched)
        );
    }

    #[test]
    fn test_detach_unknown_handle() {
        let lifecycle = enforcing(Arc::new(CountingDispatcher::default()));
        lifecycle
            .attach(mock_handle(2), mock_descriptor(0x1234))
            .unwrap();

        let err = lifecycle.detach(&mock_handle(9)).unwrap_err();
        assert_eq!(err, DetachError::NoBinding(mock_handle(9)));
        assert_eq!(err.errno(), Errno::ENODATA);
        assert_eq!(lifecycle.active_count(), 1);
        assert!(!lifecycle.is_gate_available());
    }

    #[test]
    fn test_helper_failure_keeps_binding() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        *dispatcher.fail_with.lock().unwrap() = Some(helper_failed);
        let lifecycle = enforcing(dispatcher);

        let err = lifecycle
            .attach(mock_handle(2), mock_descriptor(0x1234))
            .unwrap_err();
        assert!(matches!(err, AttachError::Dispatch { torn_down: false, .. }));
        assert_eq!(err.errno(), Errno::ENOEXEC);
        assert_eq!(lifecycle.state_of(&mock_handle(2)), Some(BindingState::Bound));

        let torn = lifecycle.detach(&mock_handle(2)).unwrap();
        assert_eq!(torn.previous, BindingState::Bound);
        assert!(lifecycle.is_gate_available());
    }

    #[test]
    fn test_interrupted_dispatch_tears_down() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        *dispatcher.fail_with.lock().unwrap() = Some(cancelled);
        let lifecycle = enforcing(dispatcher);

        let err = lifecycle
            .attach(mock_handle(2), mock_descriptor(0x1234))
            .unwrap_err();
        assert!(matches!(err, AttachError::Dispatch { torn_down: true, .. }));
        assert_eq!(lifecycle.state_of(&mock_handle(2)), None);
        assert!(lifecycle.is_gate_available());
    }

    #[test]
    fn test_dispatch_after_detach_is_orphaned() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let lifecycle = enforcing(dispatcher.clone());

        let ticket = lifecycle
            .bind(mock_handle(2), mock_descriptor(0x1234))
            .unwrap()
            .unwrap();
        assert!(ticket.needs_dispatch());
        lifecycle.detach(&mock_handle(2)).unwrap();

        assert_eq!(
            lifecycle.dispatch(ticket).unwrap(),
            AttachOutcome::Orphaned(1)
        );
        assert_eq!(lifecycle.active_count(), 0);
        assert!(lifecycle.is_gate_available());
    }

    #[test]
    fn test_stale_ticket_does_not_touch_new_binding() {
        let lifecycle = enforcing(Arc::new(CountingDispatcher::default()));

        let stale = lifecycle
            .bind(mock_handle(2), mock_descriptor(0x1234))
            .unwrap()
            .unwrap();
        lifecycle.detach(&mock_handle(2)).unwrap();
        let fresh = lifecycle
            .bind(mock_handle(2), mock_descriptor(0x1234))
            .unwrap()
            .unwrap();
        assert_ne!(stale.id(), fresh.id());

        assert_eq!(
            lifecycle.dispatch(stale).unwrap(),
            AttachOutcome::Orphaned(1)
        );
        assert_eq!(lifecycle.state_of(&mock_handle(2)), Some(BindingState::Bound));
        assert!(matches!(
            lifecycle.dispatch(fresh).unwrap(),
            AttachOutcome::Dispatched(_)
        ));
    }

    #[test]
    fn test_mark_dispatched_twice_is_rejected() {
        let gate = ExclusivityGate::new();
        let mut binding = Binding {
            id: 7,
            handle: mock_handle(1),
            key: SecretMaterial::builtin(),
            identity: target(),
            device: mock_descriptor(0x1234),
            state: BindingState::Bound,
            _permit: gate.try_acquire().unwrap(),
        };
        assert!(binding.mark_dispatched().is_ok());
        assert_eq!(binding.mark_dispatched(), Err(AlreadyDispatched(7)));
        drop(binding);
        assert!(gate.is_available());
    }

    #[test]
    fn test_binding_shares_key() {
        let key = SecretMaterial::builtin();
        let lifecycle = BindingLifecycle::new(
            Mode::Discovery { vendor_id: 0x1234 },
            key.clone(),
            Arc::new(CountingDispatcher::default()),
            CancellationToken::new(),
        );
        lifecycle
            .attach(mock_handle(2), mock_descriptor(0x1234))
            .unwrap();
        let bindings = lifecycle.bindings();
        let binding = bindings.get(&mock_handle(2)).unwrap();
        assert!(binding.key().same_material(&key));
        assert_eq!(binding.identity(), &TargetIdentity::vendor(0x1234));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let token = CancellationToken::new();
        let lifecycle = BindingLifecycle::new(
            Mode::Discovery { vendor_id: 0x1234 },
            SecretMaterial::builtin(),
            Arc::new(CountingDispatcher::default()),
            token.clone(),
        );
        lifecycle
            .attach(mock_handle(2), mock_descriptor(0x1234))
            .unwrap();

        let torn = lifecycle.shutdown();
        assert_eq!(torn.len(), 1);
        assert!(token.is_cancelled());
        assert!(lifecycle.is_gate_available());
        assert_eq!(lifecycle.active_count(), 0);
    }
}
