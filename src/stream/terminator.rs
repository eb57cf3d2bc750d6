//! Stream terminator: the logical endpoint binding one streamer to its
//! device blocks.
//!
//! A terminator aggregates the N channels of one streaming direction. It
//! tracks which block ports are bound, relays streaming state and stream
//! commands to all of them, and detaches everything on teardown. The
//! owning streamer is its sole owner; the device facade only ever holds
//! the terminator's id as a weak-map key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::block::{BlockPort, StreamCmd};
use crate::error::{Error, Result};

static TERMINATOR_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatorState {
    Unbound,
    Configuring,
    Active,
    Teardown,
}

struct Binding {
    block: Arc<dyn BlockPort>,
    port: usize,
}

pub struct StreamTerminator {
    id: String,
    direction: Direction,
    num_channels: usize,
    state: Mutex<TerminatorState>,
    bindings: Mutex<Vec<Binding>>,
}

impl StreamTerminator {
    pub fn new(direction: Direction, num_channels: usize) -> Result<Self> {
        if num_channels == 0 {
            return Err(Error::Value(
                "cannot create a streamer with zero channels".into(),
            ));
        }
        let n = TERMINATOR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = match direction {
            Direction::Rx => format!("RX Terminator {n}"),
            Direction::Tx => format!("TX Terminator {n}"),
        };
        Ok(Self {
            id,
            direction,
            num_channels,
            state: Mutex::new(TerminatorState::Unbound),
            bindings: Mutex::new(Vec::with_capacity(num_channels)),
        })
    }

    /// Process-wide unique id, the weak streamer map key.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn state(&self) -> TerminatorState {
        *self.state.lock().expect("terminator state poisoned")
    }

    /// Bind the next channel to a block port. One binding per channel.
    pub fn connect(&self, block: Arc<dyn BlockPort>, port: usize) -> Result<()> {
        let mut bindings = self.bindings.lock().expect("terminator bindings poisoned");
        if bindings.len() == self.num_channels {
            return Err(Error::Value(format!(
                "{}: all {} channels already bound, cannot bind {}",
                self.id,
                self.num_channels,
                block.block_id()
            )));
        }
        debug!(terminator = %self.id, block = %block.block_id(), port, "binding channel");
        bindings.push(Binding { block, port });
        let mut state = self.state.lock().expect("terminator state poisoned");
        if *state == TerminatorState::Unbound {
            *state = TerminatorState::Configuring;
        }
        Ok(())
    }

    /// Notify every bound block that the stream turned on or off.
    pub fn set_streaming(&self, active: bool) {
        {
            let mut state = self.state.lock().expect("terminator state poisoned");
            if *state == TerminatorState::Teardown {
                return;
            }
            *state = if active {
                TerminatorState::Active
            } else {
                TerminatorState::Configuring
            };
        }
        let bindings = self.bindings.lock().expect("terminator bindings poisoned");
        for b in bindings.iter() {
            b.block.set_active_streamer(active, b.port);
        }
    }

    /// Broadcast a stream command to every bound block.
    pub fn issue_stream_cmd(&self, cmd: StreamCmd) -> Result<()> {
        let bindings = self.bindings.lock().expect("terminator bindings poisoned");
        for b in bindings.iter() {
            b.block.issue_stream_cmd(cmd, b.port)?;
        }
        Ok(())
    }

    /// Overrun recovery: restart continuous streaming on one channel.
    pub fn restart_channel(&self, channel: usize) -> Result<()> {
        let bindings = self.bindings.lock().expect("terminator bindings poisoned");
        let b = bindings.get(channel).ok_or_else(|| {
            Error::Value(format!("{}: no channel {channel}", self.id))
        })?;
        debug!(terminator = %self.id, channel, "restarting channel after overrun");
        b.block.issue_stream_cmd(StreamCmd::StopContinuous, b.port)?;
        b.block.issue_stream_cmd(StreamCmd::StartContinuous, b.port)
    }

    /// Drop every binding after telling the blocks the streamer is gone.
    /// Idempotent; also runs on drop.
    pub fn teardown(&self) {
        {
            let mut state = self.state.lock().expect("terminator state poisoned");
            if *state == TerminatorState::Teardown {
                return;
            }
            *state = TerminatorState::Teardown;
        }
        let mut bindings = self.bindings.lock().expect("terminator bindings poisoned");
        for b in bindings.iter() {
            b.block.set_active_streamer(false, b.port);
        }
        bindings.clear();
        debug!(terminator = %self.id, "torn down");
    }
}

impl Drop for StreamTerminator {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::addr::EndpointId;
    use crate::block::StreamSignature;

    #[derive(Default)]
    struct RecordingBlock {
        active: AtomicBool,
        cmds: AtomicUsize,
    }

    impl BlockPort for RecordingBlock {
        fn block_id(&self) -> String {
            "0/TestBlock_0".into()
        }
        fn device_index(&self) -> usize {
            0
        }
        fn address(&self, _port: usize) -> Result<EndpointId> {
            Ok(EndpointId::new(0, 2, 0))
        }
        fn stream_signature(&self, _port: usize) -> StreamSignature {
            StreamSignature {
                item_type: "sc16".into(),
                packet_size: None,
            }
        }
        fn fifo_bytes(&self, _port: usize) -> usize {
            65536
        }
        fn configure_flow_control_out(
            &self,
            _enable: bool,
            _window_pkts: usize,
            _pkt_limit: usize,
            _port: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn configure_flow_control_in(&self, _interval_pkts: usize, _port: usize) -> Result<()> {
            Ok(())
        }
        fn issue_stream_cmd(&self, _cmd: StreamCmd, _port: usize) -> Result<()> {
            self.cmds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn set_active_streamer(&self, active: bool, _port: usize) {
            self.active.store(active, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_zero_channels_rejected() {
        assert!(matches!(
            StreamTerminator::new(Direction::Rx, 0),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn test_ids_are_unique_and_directional() {
        let a = StreamTerminator::new(Direction::Rx, 1).unwrap();
        let b = StreamTerminator::new(Direction::Tx, 1).unwrap();
        assert!(a.id().starts_with("RX Terminator "));
        assert!(b.id().starts_with("TX Terminator "));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_oversubscription_rejected() {
        let term = StreamTerminator::new(Direction::Rx, 1).unwrap();
        let block = Arc::new(RecordingBlock::default());
        term.connect(block.clone(), 0).unwrap();
        assert!(matches!(term.connect(block, 1), Err(Error::Value(_))));
    }

    #[test]
    fn test_state_machine_and_notifications() {
        let term = StreamTerminator::new(Direction::Tx, 1).unwrap();
        assert_eq!(term.state(), TerminatorState::Unbound);
        let block = Arc::new(RecordingBlock::default());
        term.connect(block.clone(), 0).unwrap();
        assert_eq!(term.state(), TerminatorState::Configuring);

        term.set_streaming(true);
        assert_eq!(term.state(), TerminatorState::Active);
        assert!(block.active.load(Ordering::SeqCst));

        term.teardown();
        assert_eq!(term.state(), TerminatorState::Teardown);
        assert!(!block.active.load(Ordering::SeqCst));
        // After teardown nothing flips back on.
        term.set_streaming(true);
        assert!(!block.active.load(Ordering::SeqCst));
    }

    #[test]
    fn test_restart_channel_stops_then_starts() {
        let term = StreamTerminator::new(Direction::Rx, 1).unwrap();
        let block = Arc::new(RecordingBlock::default());
        term.connect(block.clone(), 0).unwrap();
        term.restart_channel(0).unwrap();
        assert_eq!(block.cmds.load(Ordering::SeqCst), 2);
    }
}
