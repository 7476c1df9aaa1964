//! Per-connection receive state machine.
//!
//! TCP gives us a byte stream, so a packet can arrive split across any
//! number of reads, and several packets can arrive back to back. The framer
//! always asks for exactly the bytes the current phase still needs, which
//! means a read never crosses a packet boundary:
//!
//! ```text
//! AwaitingHeader --partial--> ReceivingHeader --complete--+
//!       ^                                                 |
//!       |                    bad length: reset            |
//!       +<------------------------------------------------+
//!       |                                                 v
//!       +<--complete-- ReceivingBody <--partial-- AwaitingBody
//! ```
//!
//! A header-only packet completes straight from the header phases.

use crate::runtime::connection::ConnRef;
use crate::runtime::wire::{Message, PacketHeader, HEADER_SIZE};

/// Where a connection is in the current packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvPhase {
    /// Nothing of the next packet seen yet.
    AwaitingHeader,
    /// Some header bytes seen.
    ReceivingHeader,
    /// Header complete and valid, no body bytes seen yet.
    AwaitingBody,
    /// Some body bytes seen.
    ReceivingBody,
}

/// Outcome of feeding freshly read bytes to the framer.
#[derive(Debug)]
pub enum Progress {
    /// More bytes are needed.
    Partial,
    /// A whole packet is ready for dispatch.
    Complete(Message),
    /// The header announced an impossible length; state was reset.
    Rejected { total_len: u16 },
}

pub struct Framer {
    phase: RecvPhase,
    /// Scratch space for the fixed-size header.
    header: [u8; HEADER_SIZE],
    /// Bytes already written into the current target.
    filled: usize,
    /// Bytes still needed before the phase changes.
    remaining: usize,
    /// Packet under construction once its header has been accepted.
    pending: Option<Message>,
    max_packet_length: usize,
}

impl Framer {
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            phase: RecvPhase::AwaitingHeader,
            header: [0; HEADER_SIZE],
            filled: 0,
            remaining: HEADER_SIZE,
            pending: None,
            max_packet_length,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> RecvPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    #[cfg(test)]
    /// Whether a packet buffer is currently allocated.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Buffer the next read should fill. Its length is exactly the number
    /// of bytes the current phase still needs.
    pub fn read_buf(&mut self) -> &mut [u8] {
        let range = self.filled..self.filled + self.remaining;
        match (&mut self.pending, self.phase) {
            (Some(msg), RecvPhase::AwaitingBody | RecvPhase::ReceivingBody) => {
                &mut msg.body_mut()[range]
            }
            _ => &mut self.header[range],
        }
    }

    /// Account for `n` bytes just read into [`Framer::read_buf`].
    ///
    /// `origin` is stamped into the packet when its header completes, so the
    /// packet remembers which occupant of the slot it came from.
    pub fn advance(&mut self, n: usize, origin: ConnRef) -> Progress {
        debug_assert!(n <= self.remaining, "read past the current phase");
        let n = n.min(self.remaining);

        self.filled += n;
        self.remaining -= n;

        if self.remaining > 0 {
            self.phase = match self.phase {
                RecvPhase::AwaitingHeader | RecvPhase::ReceivingHeader => {
                    RecvPhase::ReceivingHeader
                }
                RecvPhase::AwaitingBody | RecvPhase::ReceivingBody => RecvPhase::ReceivingBody,
            };
            return Progress::Partial;
        }

        match self.phase {
            RecvPhase::AwaitingHeader | RecvPhase::ReceivingHeader => self.header_complete(origin),
            RecvPhase::AwaitingBody | RecvPhase::ReceivingBody => {
                let msg = self.pending.take();
                self.reset();
                match msg {
                    Some(msg) => Progress::Complete(msg),
                    None => Progress::Partial,
                }
            }
        }
    }

    fn header_complete(&mut self, origin: ConnRef) -> Progress {
        let header = PacketHeader::decode(&self.header);
        let total = header.total_len as usize;

        if total < HEADER_SIZE || total >= self.max_packet_length {
            self.reset();
            return Progress::Rejected {
                total_len: header.total_len,
            };
        }

        let msg = Message::with_header(origin, &self.header);
        if header.body_len() == 0 {
            self.reset();
            return Progress::Complete(msg);
        }

        self.pending = Some(msg);
        self.phase = RecvPhase::AwaitingBody;
        self.filled = 0;
        self.remaining = header.body_len();
        Progress::Partial
    }

    /// Back to waiting for a header, dropping any partial packet.
    pub fn reset(&mut self) {
        self.phase = RecvPhase::AwaitingHeader;
        self.filled = 0;
        self.remaining = HEADER_SIZE;
        self.pending = None;
    }
}
