//! Channel coordinator: exclusive, ordered access to one shared bus.
//!
//! Every round trip holds the channel lock from the first byte sent until the
//! reply is decoded (or the retry budget is spent), so requests from any
//! number of callers are serialised and never interleave on the wire.
//!
//! Replies carry no request id, so a reply is matched by address alone. A
//! frame from another address (a late answer to an earlier request) is
//! dropped and reading continues until the request's own deadline.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::{self, Command, Frame};
use crate::curve::{self, CurveUpload};
use crate::error::{ChannelError, TransportError};
use crate::transport::{BusTransport, Connect};

pub struct Udc<C: Connect> {
    name: String,
    bus: Mutex<BusTransport<C>>,
    timeout: Duration,
    retries: u8,
}

impl<C: Connect> Udc<C> {
    pub fn new(
        name: impl Into<String>,
        transport: BusTransport<C>,
        timeout: Duration,
        retries: u8,
    ) -> Self {
        Self {
            name: name.into(),
            bus: Mutex::new(transport),
            timeout,
            retries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BusTransport<C>> {
        // A panic mid round trip leaves the transport usable; the next request starts fresh.
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `request` and wait for the matching reply.
    pub fn execute(&self, request: &Frame) -> Result<Frame, ChannelError> {
        let mut bus = self.lock();
        self.round_trip(&mut bus, request)
    }

    fn round_trip(&self, bus: &mut BusTransport<C>, request: &Frame) -> Result<Frame, ChannelError> {
        let address = request.address;
        let bytes = codec::encode(request);
        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!("{}: retrying 0x{:02X} (attempt {})", self.name, address, attempt + 1);
            }
            bus.send(&bytes)?;
            let deadline = Instant::now() + self.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let raw = match bus.receive_until(remaining) {
                    Ok(raw) => raw,
                    Err(TransportError::Timeout) => break,
                    Err(err) => return Err(err.into()),
                };
                let frame = match codec::decode(&raw) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("{}: discarding reply from 0x{:02X}: {}", self.name, address, err);
                        // Whatever follows a broken frame cannot be trusted either.
                        bus.discard_input()?;
                        return Err(ChannelError::Unresponsive(address));
                    }
                };
                if frame.address != address {
                    warn!(
                        "{}: discarding reply from 0x{:02X} while waiting for 0x{:02X}",
                        self.name, frame.address, address
                    );
                    continue;
                }
                return check_reply(frame);
            }
        }
        Err(ChannelError::Unresponsive(address))
    }

    /// Upload a waveform to `address` and start triggered playback.
    ///
    /// All block transfers and the arm command run under one channel lock.
    /// `keep_going` is polled before every frame; once it returns false the
    /// transfer stops with [`ChannelError::Cancelled`] and nothing is armed.
    pub fn upload_curve(
        &self,
        address: u8,
        upload: &CurveUpload,
        keep_going: impl Fn() -> bool,
    ) -> Result<(), ChannelError> {
        let mut bus = self.lock();
        let staged = upload
            .blocks()
            .into_iter()
            .try_for_each(|(block, data)| {
                bus.arm_curve_block(address, upload.curve.id, block, &data)
            })
            .and_then(|_| bus.start_synchronized_playback(&upload.trigger));
        let frames = match staged {
            Ok(frames) => frames,
            Err(err) => {
                bus.cancel_playback();
                warn!("{}: could not stage curve for 0x{:02X}: {}", self.name, address, err);
                return Err(ChannelError::Unresponsive(address));
            }
        };
        for frame in &frames {
            if !keep_going() {
                bus.cancel_playback();
                info!("{}: curve upload to 0x{:02X} cancelled", self.name, address);
                return Err(ChannelError::Cancelled);
            }
            let reply = match self.round_trip(&mut bus, frame) {
                Ok(reply) => reply,
                Err(err) => {
                    bus.cancel_playback();
                    return Err(err);
                }
            };
            if !matches!(reply.command, Command::Ok | Command::FunctionReturn) {
                bus.cancel_playback();
                return Err(ChannelError::Rejected {
                    address,
                    code: reply.command,
                });
            }
        }
        info!(
            "{}: curve {} armed on 0x{:02X}, {} points",
            self.name,
            upload.curve.name,
            address,
            upload.points.len()
        );
        Ok(())
    }

    /// Read `blocks` blocks of curve `curve_id` back from `address`.
    ///
    /// Returns the points and the index of the last block that held data.
    pub fn download_curve(
        &self,
        address: u8,
        curve_id: u8,
        blocks: u16,
        keep_going: impl Fn() -> bool,
    ) -> Result<(Vec<f32>, Option<u16>), ChannelError> {
        let mut bus = self.lock();
        let mut points = Vec::new();
        let mut last_block = None;
        for block in 0..blocks {
            if !keep_going() {
                return Err(ChannelError::Cancelled);
            }
            let request = Frame::curve_block_read(address, curve_id, block)
                .map_err(|_| ChannelError::Unresponsive(address))?;
            let reply = self.round_trip(&mut bus, &request)?;
            let (id, index, data) = reply
                .curve_block()
                .map_err(|_| ChannelError::Unresponsive(address))?;
            if id != curve_id || index != block {
                warn!(
                    "{}: 0x{:02X} returned block {}/{} for {}/{}",
                    self.name, address, id, index, curve_id, block
                );
                return Err(ChannelError::Unresponsive(address));
            }
            if data.is_empty() {
                break;
            }
            points.extend(curve::points_from_bytes(data));
            last_block = Some(block);
        }
        Ok((points, last_block))
    }

    /// Whether triggered playback started on this channel may still be running.
    pub fn playback_active(&self) -> bool {
        self.lock().playback_active()
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    /// Reopen the underlying channel after a fault.
    pub fn reinitialize(&self) -> Result<(), TransportError> {
        let mut bus = self.lock();
        bus.reopen()?;
        info!("{}: channel reopened", self.name);
        Ok(())
    }
}

/// Turn protocol error replies into rejections.
fn check_reply(frame: Frame) -> Result<Frame, ChannelError> {
    if frame.command.is_error() {
        debug!("0x{:02X} answered {:?}", frame.address, frame.command);
        return Err(ChannelError::Rejected {
            address: frame.address,
            code: frame.command,
        });
    }
    Ok(frame)
}
