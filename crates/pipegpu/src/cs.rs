//! Budgeted command stream writer.
//!
//! Every write happens inside a named frame opened with [`CommandStream::begin`]. A frame carries a
//! dword reservation; writing past it is a protocol violation that asserts in debug builds and is
//! rejected without touching the stream in release builds. A reservation of zero leaves the frame
//! bounded only by the stream's capacity.

use std::fmt;

use pipegpu_protocol::packet::{pkt0, pkt0_one_reg, pkt3, MAX_PACKET_DWORDS, PKT3_NOP};
use tracing::{debug, warn};

use crate::backend::{Fence, Reloc, RelocUsage, Submission};
use crate::error::{BackendError, CsError};
use crate::resource::ResourceHandle;

/// Receives finished streams. Bound once when the owning context is created.
pub type FlushHandler = Box<dyn FnMut(Submission) -> Result<Fence, BackendError> + Send>;

#[derive(Debug, Clone, Copy)]
struct Frame {
    name: &'static str,
    reserved: u32,
    start: usize,
    relocs_start: usize,
}

pub struct CommandStream {
    context_id: u64,
    capacity: usize,
    dwords: Vec<u32>,
    relocs: Vec<Reloc>,
    frame: Option<Frame>,
    flush_handler: Option<FlushHandler>,
    flushes: u64,
    submitted_dwords: u64,
}

impl CommandStream {
    pub fn new(context_id: u64, capacity_dwords: usize) -> Self {
        Self {
            context_id,
            capacity: capacity_dwords,
            dwords: Vec::with_capacity(capacity_dwords),
            relocs: Vec::new(),
            frame: None,
            flush_handler: None,
            flushes: 0,
            submitted_dwords: 0,
        }
    }

    pub fn set_flush_handler(&mut self, handler: FlushHandler) {
        self.flush_handler = Some(handler);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.dwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.dwords.len())
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// Streams handed to the flush handler so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn submitted_dwords(&self) -> u64 {
        self.submitted_dwords
    }

    pub fn in_frame(&self) -> bool {
        self.frame.is_some()
    }

    /// Open a frame named `name` with a budget of `reserved` dwords (zero: unbounded).
    pub fn begin(&mut self, name: &'static str, reserved: u32) -> Result<(), CsError> {
        if let Some(open) = self.frame {
            return Err(CsError::FrameOpen { open: open.name });
        }
        let remaining = self.remaining();
        if reserved as usize > remaining {
            return Err(CsError::Full {
                requested: reserved as usize,
                remaining,
            });
        }
        self.frame = Some(Frame {
            name,
            reserved,
            start: self.dwords.len(),
            relocs_start: self.relocs.len(),
        });
        Ok(())
    }

    /// Close the current frame. Returns the number of dwords it wrote.
    pub fn end(&mut self) -> Result<u32, CsError> {
        let frame = self.frame.take().ok_or(CsError::NotInFrame)?;
        Ok((self.dwords.len() - frame.start) as u32)
    }

    /// Close the current frame and roll the stream back to where it began.
    pub fn abort(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.dwords.truncate(frame.start);
            self.relocs.truncate(frame.relocs_start);
            debug!(frame = frame.name, "frame aborted");
        }
    }

    fn push(&mut self, words: &[u32]) -> Result<(), CsError> {
        let frame = self.frame.ok_or(CsError::NotInFrame)?;
        let written = self.dwords.len() - frame.start + words.len();
        if frame.reserved != 0 && written > frame.reserved as usize {
            debug_assert!(
                false,
                "`{}` overran its reservation: {} > {} dwords",
                frame.name, written, frame.reserved
            );
            warn!(
                frame = frame.name,
                written,
                reserved = frame.reserved,
                "command stream reservation overrun"
            );
            return Err(CsError::Overrun {
                atom: frame.name,
                reserved: frame.reserved,
                written: written as u32,
            });
        }
        if words.len() > self.remaining() {
            return Err(CsError::Full {
                requested: words.len(),
                remaining: self.remaining(),
            });
        }
        self.dwords.extend_from_slice(words);
        Ok(())
    }

    /// Header count for a payload of `len` dwords.
    fn packet_count(len: usize) -> Result<u32, CsError> {
        if len == 0 || len > MAX_PACKET_DWORDS {
            return Err(CsError::PacketSize { count: len });
        }
        Ok(len as u32)
    }

    pub fn out_reg(&mut self, reg: u32, value: u32) -> Result<(), CsError> {
        self.push(&[pkt0(reg, 1), value])
    }

    /// Consecutive registers starting at `reg`. Empty slices write nothing.
    pub fn out_reg_seq(&mut self, reg: u32, values: &[u32]) -> Result<(), CsError> {
        if values.is_empty() {
            return Ok(());
        }
        let count = Self::packet_count(values.len())?;
        let mut words = Vec::with_capacity(values.len() + 1);
        words.push(pkt0(reg, count));
        words.extend_from_slice(values);
        self.push(&words)
    }

    /// Every value to the single register `reg`. Empty slices write nothing.
    pub fn out_reg_one(&mut self, reg: u32, values: &[u32]) -> Result<(), CsError> {
        if values.is_empty() {
            return Ok(());
        }
        let count = Self::packet_count(values.len())?;
        let mut words = Vec::with_capacity(values.len() + 1);
        words.push(pkt0_one_reg(reg, count));
        words.extend_from_slice(values);
        self.push(&words)
    }

    /// Type-3 packet. The payload must hold between one and [`MAX_PACKET_DWORDS`] dwords.
    pub fn out_pkt3(&mut self, opcode: u8, payload: &[u32]) -> Result<(), CsError> {
        let count = Self::packet_count(payload.len())?;
        let mut words = Vec::with_capacity(payload.len() + 1);
        words.push(pkt3(opcode, count));
        words.extend_from_slice(payload);
        self.push(&words)
    }

    /// Replay a prerecorded block verbatim.
    pub fn out_raw(&mut self, words: &[u32]) -> Result<(), CsError> {
        if words.is_empty() {
            return Ok(());
        }
        self.push(words)
    }

    /// Reference `resource` at this point of the stream and pin it until submission.
    ///
    /// A resource named twice in one stream shares a single relocation entry whose usage is the
    /// union of both.
    pub fn out_reloc(&mut self, resource: &ResourceHandle, usage: RelocUsage) -> Result<(), CsError> {
        let existing = self
            .relocs
            .iter()
            .position(|reloc| reloc.resource.ptr_eq(resource));
        let index = existing.unwrap_or(self.relocs.len());
        self.push(&[pkt3(PKT3_NOP, 1), index as u32])?;
        match existing {
            Some(i) => self.relocs[i].usage |= usage,
            None => self.relocs.push(Reloc {
                resource: resource.clone(),
                usage,
            }),
        }
        Ok(())
    }

    /// Hand the stream to the flush handler. An empty stream is left alone.
    pub fn flush(&mut self) -> Result<Option<Fence>, CsError> {
        if let Some(open) = self.frame {
            return Err(CsError::FrameOpen { open: open.name });
        }
        if self.dwords.is_empty() {
            return Ok(None);
        }
        let handler = self.flush_handler.as_mut().ok_or(CsError::NoFlushHandler)?;

        let dwords = std::mem::replace(&mut self.dwords, Vec::with_capacity(self.capacity));
        let relocs = std::mem::take(&mut self.relocs);
        let len = dwords.len();
        let fence = handler(Submission {
            context_id: self.context_id,
            dwords,
            relocs,
        })?;

        self.flushes += 1;
        self.submitted_dwords += len as u64;
        debug!(
            context = self.context_id,
            dwords = len,
            fence = fence.0,
            "command stream flushed"
        );
        Ok(Some(fence))
    }

    /// Drop everything written since the last flush without submitting it.
    pub fn discard(&mut self) {
        self.frame = None;
        self.dwords.clear();
        self.relocs.clear();
    }
}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("context_id", &self.context_id)
            .field("len", &self.dwords.len())
            .field("capacity", &self.capacity)
            .field("relocs", &self.relocs.len())
            .field("frame", &self.frame.map(|frame| frame.name))
            .field("flushes", &self.flushes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pipegpu_protocol::{decode_packets, register_writes, Packet};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::{BindFlags, DeviceBackend, ImmediateDevice};
    use crate::caps::{ChipFamily, DeviceCaps};

    fn collecting_stream(capacity: usize) -> (CommandStream, Arc<Mutex<Vec<Submission>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut cs = CommandStream::new(1, capacity);
        let captured = Arc::clone(&sink);
        let mut next = 0u64;
        cs.set_flush_handler(Box::new(move |submission| {
            captured.lock().unwrap().push(submission);
            next += 1;
            Ok(Fence(next))
        }));
        (cs, sink)
    }

    #[test]
    fn writes_outside_a_frame_are_rejected() {
        let (mut cs, _) = collecting_stream(16);
        assert_eq!(cs.out_reg(0x4100, 0), Err(CsError::NotInFrame));
        assert!(cs.is_empty());
    }

    #[test]
    fn frames_do_not_nest() {
        let (mut cs, _) = collecting_stream(16);
        cs.begin("outer", 4).unwrap();
        assert_eq!(
            cs.begin("inner", 2),
            Err(CsError::FrameOpen { open: "outer" })
        );
        assert_eq!(cs.end().unwrap(), 0);
    }

    #[test]
    fn exact_reservation_is_accepted() {
        let (mut cs, _) = collecting_stream(16);
        cs.begin("scissor", 3).unwrap();
        cs.out_reg_seq(0x43E8, &[1, 2]).unwrap();
        assert_eq!(cs.end().unwrap(), 3);
        assert_eq!(register_writes(cs.dwords()).unwrap(), vec![(0x43E8, 1), (0x43EC, 2)]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "overran its reservation")]
    fn overrun_asserts_in_debug_builds() {
        let (mut cs, _) = collecting_stream(16);
        cs.begin("ztop", 2).unwrap();
        cs.out_reg(0x4F14, 1).unwrap();
        let _ = cs.out_reg(0x4F14, 0);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn overrun_is_rejected_without_writing_in_release_builds() {
        let (mut cs, _) = collecting_stream(16);
        cs.begin("ztop", 2).unwrap();
        cs.out_reg(0x4F14, 1).unwrap();
        assert_eq!(
            cs.out_reg(0x4F14, 0),
            Err(CsError::Overrun {
                atom: "ztop",
                reserved: 2,
                written: 4,
            })
        );
        assert_eq!(cs.len(), 2);
    }

    #[test]
    fn reservation_beyond_capacity_is_full() {
        let (mut cs, _) = collecting_stream(4);
        assert_eq!(
            cs.begin("big", 5),
            Err(CsError::Full {
                requested: 5,
                remaining: 4,
            })
        );
    }

    #[test]
    fn unbounded_frames_stop_at_capacity() {
        let (mut cs, _) = collecting_stream(4);
        cs.begin("var", 0).unwrap();
        cs.out_reg(0x4100, 0).unwrap();
        assert!(matches!(
            cs.out_reg_seq(0x4104, &[0, 0]),
            Err(CsError::Full { .. })
        ));
        cs.end().unwrap();
        assert_eq!(cs.len(), 2);
    }

    #[test]
    fn unencodable_packets_are_rejected() {
        let (mut cs, _) = collecting_stream(MAX_PACKET_DWORDS + 8);
        cs.begin("big", 0).unwrap();
        assert_eq!(
            cs.out_pkt3(PKT3_NOP, &[]),
            Err(CsError::PacketSize { count: 0 })
        );
        let values = vec![0; MAX_PACKET_DWORDS + 1];
        assert_eq!(
            cs.out_reg_seq(0x4100, &values),
            Err(CsError::PacketSize {
                count: MAX_PACKET_DWORDS + 1
            })
        );
        assert_eq!(
            cs.out_reg_one(0x2208, &values),
            Err(CsError::PacketSize {
                count: MAX_PACKET_DWORDS + 1
            })
        );
        assert!(cs.is_empty());

        cs.out_reg_one(0x2208, &values[..MAX_PACKET_DWORDS]).unwrap();
        cs.end().unwrap();
        assert_eq!(cs.len(), MAX_PACKET_DWORDS + 1);
    }

    #[test]
    fn flush_of_empty_stream_is_a_no_op() {
        let (mut cs, sink) = collecting_stream(8);
        assert_eq!(cs.flush(), Ok(None));
        assert_eq!(cs.flush(), Ok(None));
        assert!(sink.lock().unwrap().is_empty());
        assert_eq!(cs.flushes(), 0);
    }

    #[test]
    fn flush_hands_over_stream_and_resets() {
        let (mut cs, sink) = collecting_stream(8);
        cs.begin("a", 2).unwrap();
        cs.out_reg(0x4100, 0).unwrap();
        cs.end().unwrap();

        assert_eq!(cs.flush(), Ok(Some(Fence(1))));
        assert!(cs.is_empty());
        assert_eq!(cs.remaining(), 8);
        assert_eq!(sink.lock().unwrap()[0].dwords.len(), 2);
        assert_eq!(cs.flush(), Ok(None));
    }

    #[test]
    fn flush_inside_frame_is_refused() {
        let (mut cs, _) = collecting_stream(8);
        cs.begin("open", 0).unwrap();
        assert_eq!(cs.flush(), Err(CsError::FrameOpen { open: "open" }));
    }

    #[test]
    fn abort_rolls_back_dwords_and_relocs() {
        let dev: Arc<dyn DeviceBackend> =
            Arc::new(ImmediateDevice::new(DeviceCaps::new(ChipFamily::R300)));
        let res = ResourceHandle::create_buffer(&dev, None, 16, BindFlags::VERTEX_BUFFER).unwrap();
        let (mut cs, _) = collecting_stream(16);

        cs.begin("draw", 0).unwrap();
        cs.out_reloc(&res, RelocUsage::READ).unwrap();
        cs.abort();

        assert!(cs.is_empty());
        assert!(cs.relocs().is_empty());
        assert_eq!(res.ref_count(), 1);
    }

    #[test]
    fn relocs_pin_until_flush_and_are_deduplicated() {
        let dev: Arc<dyn DeviceBackend> =
            Arc::new(ImmediateDevice::new(DeviceCaps::new(ChipFamily::R300)));
        let res = ResourceHandle::create_buffer(&dev, None, 16, BindFlags::VERTEX_BUFFER).unwrap();
        let (mut cs, sink) = collecting_stream(16);

        cs.begin("fb", 0).unwrap();
        cs.out_reloc(&res, RelocUsage::READ).unwrap();
        cs.out_reloc(&res, RelocUsage::WRITE).unwrap();
        cs.end().unwrap();

        assert_eq!(cs.relocs().len(), 1);
        assert_eq!(cs.relocs()[0].usage, RelocUsage::READ | RelocUsage::WRITE);
        assert_eq!(res.ref_count(), 2);
        assert_eq!(
            decode_packets(cs.dwords()).unwrap(),
            vec![Packet::Reloc { index: 0 }, Packet::Reloc { index: 0 }]
        );

        cs.flush().unwrap();
        // The collected submission still pins the resource.
        assert_eq!(res.ref_count(), 2);
        sink.lock().unwrap().clear();
        assert_eq!(res.ref_count(), 1);
    }

    #[test]
    fn flush_without_handler_fails() {
        let mut cs = CommandStream::new(1, 8);
        cs.begin("a", 0).unwrap();
        cs.out_reg(0x4100, 0).unwrap();
        cs.end().unwrap();
        assert_eq!(cs.flush(), Err(CsError::NoFlushHandler));
        assert_eq!(cs.len(), 2);
    }
}
