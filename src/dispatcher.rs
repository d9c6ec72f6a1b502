//! Routes notification frames to decoders, the state store and waiting commands.

use crate::correlator::Correlator;
use crate::protocol as proto;
use crate::response::{CellPack, DeviceInfo, Response, RuntimeSnapshot, TimerSchedule};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Latest successfully decoded record of each kind.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceState {
    pub device_info: Option<DeviceInfo>,
    pub runtime: Option<RuntimeSnapshot>,
    pub cells: Option<CellPack>,
    pub timers: Option<TimerSchedule>,
}

impl DeviceState {
    fn store(&mut self, response: Response) {
        match response {
            Response::DeviceInfo(info) => self.device_info = Some(info),
            Response::Runtime(runtime) => self.runtime = Some(runtime),
            Response::Cells(cells) => self.cells = Some(cells),
            Response::Timers(timers) => self.timers = Some(timers),
        }
    }
}

/// Handles every incoming notification.
///
/// Cheap to clone; all clones share the same state and correlator. Dispatching
/// never blocks on async work, so a transport may call it from its
/// notification callback.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<Mutex<DeviceState>>,
    correlator: Arc<Correlator>,
}

impl Dispatcher {
    pub fn new(state: Arc<Mutex<DeviceState>>, correlator: Arc<Correlator>) -> Self {
        Self { state, correlator }
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> DeviceState {
        self.lock_state().clone()
    }

    /// Runs `f` with the current state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.lock_state())
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles one notification frame and returns its opcode.
    ///
    /// Frames shorter than the header are rejected. A decode failure leaves the
    /// state untouched, but the waiting command is resolved either way so it
    /// does not run into its timeout.
    pub fn dispatch(&self, frame: &[u8]) -> Result<u8, proto::Error> {
        let opcode = proto::extract_opcode(frame).inspect_err(|_| {
            log::warn!("Received malformed notification: {}", hex::encode(frame));
        })?;
        log::debug!("Received notification 0x{opcode:02X}: {}", hex::encode(frame));

        match Response::decode(opcode, frame) {
            Some(Ok(response)) => self.lock_state().store(response),
            Some(Err(error)) => log::warn!("{error}"),
            None => log::debug!("No decoder for 0x{opcode:02X}, treating as acknowledgement"),
        }

        self.correlator.resolve(opcode, frame);
        Ok(opcode)
    }
}
