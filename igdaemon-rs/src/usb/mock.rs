/* Scripted in-memory transceiver used by the tests.
 *
 * The script is a queue of actions for the IN endpoint; OUT writes are
 * recorded for later inspection.  Tests push additional IN data while
 * the daemon runs to model device-initiated traffic. */

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{UsbError, UsbTransceiver};

/// One scripted result for an `interrupt_in` call.
#[derive(Debug)]
pub enum InAction {
    /// Deliver these bytes.
    Data(Vec<u8>),
    /// Deliver these bytes, but only once at least this many OUT
    /// transfers have happened; until then reads time out.  Models a
    /// device answering a request.
    AfterWrite(usize, Vec<u8>),
    /// Time out, as an idle device does.
    Timeout,
    /// Report the device gone.
    Disconnect,
    /// Report the device gone once at least this many OUT transfers
    /// have happened; until then reads time out.
    DisconnectAfterWrite(usize),
}

#[derive(Default)]
struct MockState {
    in_script: VecDeque<InAction>,
    written: Vec<Vec<u8>>,
    /// What to do when the script runs dry.
    hangup_when_empty: bool,
}

pub struct MockTransceiver {
    state: Mutex<MockState>,
    max_packet_size: usize,
}

impl MockTransceiver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            max_packet_size: 8,
        }
    }

    /// Disconnect instead of timing out once the script is exhausted.
    pub fn hangup_when_empty(self) -> Self {
        self.state.lock().unwrap().hangup_when_empty = true;
        self
    }

    pub fn push_in(&self, action: InAction) {
        self.state.lock().unwrap().in_script.push_back(action);
    }

    /// Queue a device->host control packet carrying `opcode` and
    /// `payload`, as the firmware frames one.
    pub fn push_ctl_from_device(&self, opcode: u8, payload: &[u8]) {
        let mut data = vec![0x00, 0x00, 0xDC, opcode];
        data.extend_from_slice(payload);
        self.push_in(InAction::Data(data));
    }

    /// Queue an acknowledgement released only after `writes` OUT
    /// transfers have been observed.
    pub fn push_ack_after_write(&self, writes: usize, opcode: u8, payload: &[u8]) {
        let mut data = vec![0x00, 0x00, 0xDC, opcode];
        data.extend_from_slice(payload);
        self.push_in(InAction::AfterWrite(writes, data));
    }

    /// Queue raw receive sample bytes plus the trailing fill-level
    /// byte the firmware appends.
    pub fn push_recv_data(&self, samples: &[u8], fill_level: u8) {
        let mut data = samples.to_vec();
        data.push(fill_level);
        self.push_in(InAction::Data(data));
    }

    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().unwrap().written)
    }

    pub fn written_count(&self) -> usize {
        self.state.lock().unwrap().written.len()
    }
}

#[async_trait]
impl UsbTransceiver for MockTransceiver {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn interrupt_in(&self, len: usize, _timeout: Duration) -> Result<Vec<u8>, UsbError> {
        /* yield so concurrently queued writes get a chance to land in
         * script order */
        tokio::task::yield_now().await;

        let action = {
            let mut state = self.state.lock().unwrap();
            let gated = matches!(
                state.in_script.front(),
                Some(InAction::AfterWrite(writes, _) | InAction::DisconnectAfterWrite(writes))
                    if state.written.len() < *writes
            );
            if gated {
                InAction::Timeout
            } else {
                match state.in_script.pop_front() {
                    Some(action) => action,
                    None if state.hangup_when_empty => return Err(UsbError::Disconnected),
                    None => InAction::Timeout,
                }
            }
        };

        match action {
            InAction::Data(mut data) | InAction::AfterWrite(_, mut data) => {
                data.truncate(len);
                Ok(data)
            }
            InAction::Timeout => {
                /* a real timeout takes recv_timeout; a short sleep
                 * keeps tests fast without busy-spinning the reader */
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err(UsbError::Timeout)
            }
            InAction::Disconnect | InAction::DisconnectAfterWrite(_) => {
                Err(UsbError::Disconnected)
            }
        }
    }

    async fn interrupt_out(&self, data: &[u8], _timeout: Duration) -> Result<(), UsbError> {
        self.state.lock().unwrap().written.push(data.to_vec());
        Ok(())
    }

    async fn reset(&self) -> Result<(), UsbError> {
        Ok(())
    }

    async fn clear_halt(&self) -> Result<(), UsbError> {
        Ok(())
    }
}
