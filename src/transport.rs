//! Byte-level I/O over one physical channel.
//!
//! The channel itself is any driver implementing [`embedded_io::Read`] and
//! [`embedded_io::Write`] (UART, RS-485 bridge, coprocessor mailbox). Reads
//! are expected to return quickly: a driver reporting
//! [`embedded_io::ErrorKind::TimedOut`] or `Other` (would-block) means "no
//! bytes yet", and the transport keeps polling until its own deadline.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use embedded_io::{Error as _, ErrorKind, Read as _, Write as _};
use tracing::{debug, warn};

use crate::catalog::SYNC_PLAYBACK_FUNCTION;
use crate::codec::{self, Frame, FrameBuffer, HEADER_LEN, MAX_FRAME_LEN};
use crate::curve::TriggerSpec;
use crate::error::{DecodeError, TransportError};

/// Pause between polls of an idle channel.
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Upper bound on bytes dropped by one [`BusTransport::discard_input`].
const MAX_DISCARD: usize = 4 * MAX_FRAME_LEN;

/// Opens (and re-opens) the physical channel.
pub trait Connect: Send {
    type Channel: embedded_io::Read + embedded_io::Write + Send;

    fn connect(&mut self) -> Result<Self::Channel, TransportError>;
}

impl<F, S> Connect for F
where
    F: FnMut() -> Result<S, TransportError> + Send,
    S: embedded_io::Read + embedded_io::Write + Send,
{
    type Channel = S;

    fn connect(&mut self) -> Result<S, TransportError> {
        self()
    }
}

/// A curve block staged for the next synchronized playback.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArmedBlock {
    curve_id: u8,
    block: u16,
    frame: Frame,
    points: usize,
}

pub struct BusTransport<C: Connect> {
    connector: C,
    channel: Option<C::Channel>,
    /// Armed blocks per device address.
    armed: BTreeMap<u8, Vec<ArmedBlock>>,
    playback_until: Option<Instant>,
    /// Input may hold leftovers of an earlier exchange.
    stale_input: bool,
}

impl<C: Connect> BusTransport<C> {
    /// Open the channel through `connector`.
    pub fn open(mut connector: C) -> Result<Self, TransportError> {
        let channel = connector.connect()?;
        Ok(Self {
            connector,
            channel: Some(channel),
            armed: BTreeMap::new(),
            playback_until: None,
            stale_input: false,
        })
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Drop the current channel (if any) and connect again.
    pub fn reopen(&mut self) -> Result<(), TransportError> {
        self.channel = None;
        self.armed.clear();
        self.playback_until = None;
        self.stale_input = false;
        self.channel = Some(self.connector.connect()?);
        Ok(())
    }

    /// Write one encoded frame.
    ///
    /// Leftovers of a timed out or unreadable exchange are dropped first, so
    /// the reply read next starts on a frame boundary.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.stale_input {
            self.discard_input()?;
        }
        let channel = self.channel.as_mut().ok_or(TransportError::Closed)?;
        let result = channel.write_all(bytes).and_then(|_| channel.flush());
        if let Err(err) = result {
            let kind = err.kind();
            warn!("Channel write failed: {:?}", kind);
            self.channel = None;
            return Err(TransportError::Fault(kind));
        }
        Ok(())
    }

    /// Collect one frame's worth of bytes, waiting at most `timeout`.
    ///
    /// The bytes are not validated beyond the size field; the codec does that.
    pub fn receive_until(&mut self, timeout: Duration) -> Result<FrameBuffer, TransportError> {
        let channel = self.channel.as_mut().ok_or(TransportError::Closed)?;
        let result = read_frame(channel, Instant::now() + timeout);
        match &result {
            Err(TransportError::Fault(kind)) => {
                warn!("Channel read failed: {:?}", kind);
                self.channel = None;
            }
            Err(TransportError::Timeout) => self.stale_input = true,
            Ok(frame) if frame.len() < codec::expected_len(frame).unwrap_or(0) => {
                // Oversized announcement: the rest of it is still on the wire.
                self.stale_input = true;
            }
            _ => {}
        }
        result
    }

    /// Read and drop whatever input is already waiting on the channel.
    ///
    /// Returns the number of bytes dropped. The frame format has no start
    /// marker to scan for, so the only way back onto a frame boundary is an
    /// empty receive buffer.
    pub fn discard_input(&mut self) -> Result<usize, TransportError> {
        self.stale_input = false;
        let Some(channel) = self.channel.as_mut() else {
            return Err(TransportError::Closed);
        };
        let mut chunk = [0u8; 64];
        let mut discarded = 0;
        while discarded < MAX_DISCARD {
            match channel.read(&mut chunk) {
                Ok(0) => break,
                Ok(count) => discarded += count,
                Err(err) => match err.kind() {
                    ErrorKind::TimedOut | ErrorKind::Other | ErrorKind::Interrupted => break,
                    kind => {
                        warn!("Channel read failed: {:?}", kind);
                        self.channel = None;
                        return Err(TransportError::Fault(kind));
                    }
                },
            }
        }
        if discarded > 0 {
            debug!("Discarded {} stale byte(s)", discarded);
        }
        Ok(discarded)
    }

    /// Stage one curve block for `address`. Nothing is sent until
    /// [`Self::start_synchronized_playback`].
    pub fn arm_curve_block(
        &mut self,
        address: u8,
        curve_id: u8,
        block: u16,
        data: &[u8],
    ) -> Result<(), DecodeError> {
        let frame = Frame::curve_block_write(address, curve_id, block, data)?;
        let blocks = self.armed.entry(address).or_default();
        blocks.retain(|b| !(b.curve_id == curve_id && b.block == block));
        blocks.push(ArmedBlock {
            curve_id,
            block,
            frame,
            points: data.len() / 4,
        });
        Ok(())
    }

    /// Number of blocks currently staged.
    pub fn armed_blocks(&self) -> usize {
        self.armed.values().map(Vec::len).sum()
    }

    /// Take every staged block and return the frame sequence that loads and
    /// arms them: the block transfers in order, then one arm command per
    /// device carrying `trigger`.
    ///
    /// The transport considers the channel busy with playback until the
    /// longest armed curve has been played `trigger.repetitions` times.
    pub fn start_synchronized_playback(
        &mut self,
        trigger: &TriggerSpec,
    ) -> Result<Vec<Frame>, DecodeError> {
        let armed = std::mem::take(&mut self.armed);
        let mut frames = Vec::new();
        let mut arm_commands = Vec::new();
        let mut longest = 0;

        for (address, mut blocks) in armed {
            blocks.sort_by_key(|b| (b.curve_id, b.block));
            let mut points_per_curve: BTreeMap<u8, usize> = BTreeMap::new();
            for block in blocks {
                *points_per_curve.entry(block.curve_id).or_default() += block.points;
                frames.push(block.frame);
            }
            longest = longest.max(points_per_curve.values().copied().max().unwrap_or(0));
            arm_commands.push(Frame::execute_function(
                address,
                SYNC_PLAYBACK_FUNCTION,
                &trigger.encode(),
            )?);
        }
        frames.extend(arm_commands);

        let duration = trigger.playback_duration(longest);
        debug!("Synchronized playback armed for {:?}", duration);
        self.playback_until = Some(Instant::now() + duration);
        Ok(frames)
    }

    /// Forget a playback whose arming sequence did not complete.
    pub fn cancel_playback(&mut self) {
        self.armed.clear();
        self.playback_until = None;
    }

    /// Whether a previously started playback may still be running.
    pub fn playback_active(&self) -> bool {
        self.playback_until
            .is_some_and(|until| Instant::now() < until)
    }
}

/// Read until the size field is satisfied or the deadline passes.
fn read_frame<S: embedded_io::Read>(
    channel: &mut S,
    deadline: Instant,
) -> Result<FrameBuffer, TransportError> {
    let mut frame = FrameBuffer::new();
    let mut chunk = [0u8; 64];
    loop {
        let wanted = match codec::expected_len(&frame) {
            Some(total) if total > MAX_FRAME_LEN => {
                // Announced size cannot be valid; hand back what we have for the codec to reject.
                return Ok(frame);
            }
            Some(total) => total - frame.len(),
            None => HEADER_LEN - frame.len(),
        };
        if wanted == 0 {
            return Ok(frame);
        }

        let limit = wanted.min(chunk.len());
        match channel.read(&mut chunk[..limit]) {
            Ok(0) => {}
            Ok(count) => {
                // `limit` never exceeds the remaining frame capacity.
                let _ = frame.extend_from_slice(&chunk[..count]);
                continue;
            }
            Err(err) => match err.kind() {
                ErrorKind::TimedOut | ErrorKind::Other | ErrorKind::Interrupted => {}
                kind => return Err(TransportError::Fault(kind)),
            },
        }

        if Instant::now() >= deadline {
            if !frame.is_empty() {
                debug!("Timed out with {} byte(s) of a partial frame", frame.len());
            }
            return Err(TransportError::Timeout);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
