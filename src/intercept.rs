//! Interception event surface
//!
//! The privileged interception mechanism (syscall probe, LSM hook, eBPF
//! program, or a userland tracing shim) is an external collaborator;
//! this module defines the seam it feeds: packed event records, a pull
//! source trait, and a dispatch pump into the engine.
//!
//! ## Synchronous delivery
//!
//! The pump reads the next event only after `observe` for the previous
//! one has returned. The interception point keeps the traced process
//! suspended until then, so the automaton can never race behind the
//! program and miss a violation that is already observable. Within one
//! process, marker events arrive in program order; across processes no
//! ordering is assumed.
//!
//! ## Wire form
//!
//! One 9-byte little-endian record per event:
//!
//! ```text
//! { tag: u8, pid: u32, value: i32 }    tag 0 = marker, 1 = exit
//! ```
//!
//! `value` is the 32-bit argument the program passed to the marker
//! function; it is zero for exit records.

#![forbid(unsafe_code)]

use std::io::{self, Read};

use tracing::{debug, info};

use crate::engine::{Engine, ObserveOutcome};
use crate::{MarkerId, Pid};

/// Packed event record length in bytes.
pub const EVENT_RECORD_LEN: usize = 9;

const TAG_MARKER: u8 = 0;
const TAG_EXIT: u8 = 1;

/// One interception event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The process emitted a marker immediately before a library call.
    Marker {
        /// Emitting process, as seen by the privileged context.
        pid: Pid,
        /// The argument passed to the marker function.
        value: MarkerId,
    },
    /// The process exited; its policy is torn down.
    Exit {
        /// Exiting process.
        pid: Pid,
    },
}

/// Errors surfaced while decoding an event record.
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    /// The record is shorter than [`EVENT_RECORD_LEN`].
    #[error("short event record: {0} of 9 bytes")]
    Truncated(usize),
    /// The record carries an unknown tag byte.
    #[error("unknown event tag {0}")]
    BadTag(u8),
}

impl Event {
    /// Encode the packed wire record.
    pub fn encode(&self) -> [u8; EVENT_RECORD_LEN] {
        let mut out = [0u8; EVENT_RECORD_LEN];
        let (tag, pid, value) = match *self {
            Event::Marker { pid, value } => (TAG_MARKER, pid, value),
            Event::Exit { pid } => (TAG_EXIT, pid, 0),
        };
        out[0] = tag;
        out[1..5].copy_from_slice(&pid.to_le_bytes());
        out[5..9].copy_from_slice(&value.to_le_bytes());
        out
    }

    /// Decode one packed wire record.
    pub fn decode(bytes: &[u8]) -> Result<Event, EventDecodeError> {
        if bytes.len() < EVENT_RECORD_LEN {
            return Err(EventDecodeError::Truncated(bytes.len()));
        }
        let pid = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let value = i32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        match bytes[0] {
            TAG_MARKER => Ok(Event::Marker { pid, value }),
            TAG_EXIT => Ok(Event::Exit { pid }),
            tag => Err(EventDecodeError::BadTag(tag)),
        }
    }
}

/// A blocking pull source of interception events. `Ok(None)` means the
/// source is exhausted and the pump should return.
pub trait EventSource {
    /// Block until the next event, end of stream, or an I/O failure.
    fn next_event(&mut self) -> io::Result<Option<Event>>;
}

/// An [`EventSource`] over any byte stream of packed records (a pipe or
/// character device fed by the interception stub). A clean EOF on a
/// record boundary ends the stream.
pub struct RecordReader<R> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    /// Wrap a byte stream.
    pub fn new(inner: R) -> Self {
        RecordReader { inner }
    }
}

impl<R: Read> EventSource for RecordReader<R> {
    fn next_event(&mut self) -> io::Result<Option<Event>> {
        let mut buf = [0u8; EVENT_RECORD_LEN];
        let mut filled = 0;
        while filled < EVENT_RECORD_LEN {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "event stream ended mid-record",
                ));
            }
            filled += n;
        }
        Event::decode(&buf).map(Some).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Totals for one pump run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Marker events dispatched.
    pub markers: u64,
    /// Exit events dispatched.
    pub exits: u64,
    /// Observations that ended in a violation.
    pub violations: u64,
}

/// Dispatch events into the engine until the source is exhausted.
///
/// Dispatch is strictly serial: each `observe` completes before the
/// next event is pulled.
pub fn pump<S: EventSource + ?Sized>(source: &mut S, engine: &Engine) -> io::Result<PumpStats> {
    let mut stats = PumpStats::default();
    while let Some(event) = source.next_event()? {
        match event {
            Event::Marker { pid, value } => {
                stats.markers += 1;
                if engine.observe(pid, value) == ObserveOutcome::Violation {
                    stats.violations += 1;
                }
            }
            Event::Exit { pid } => {
                stats.exits += 1;
                debug!(pid, "process exit, dropping policy");
                engine.uninstall(pid);
            }
        }
    }
    info!(
        markers = stats.markers,
        exits = stats.exits,
        violations = stats.violations,
        "event source drained"
    );
    Ok(stats)
}
