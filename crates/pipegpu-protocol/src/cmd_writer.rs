//! Unbudgeted dword builder.
//!
//! Used to pre-record fixed command blocks that the driver replays verbatim (cache flushes,
//! invariant state) and by tests to spell out expected streams. The driver's live command
//! stream enforces per-atom budgets on top of this layout; see `pipegpu::cs`.

use crate::packet::{pkt0, pkt0_one_reg, pkt3, PKT3_NOP};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegWriter {
    buf: Vec<u32>,
}

impl RegWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(dwords: usize) -> Self {
        Self {
            buf: Vec::with_capacity(dwords),
        }
    }

    /// Write a single register (2 dwords).
    pub fn out_reg(&mut self, reg: u32, value: u32) -> &mut Self {
        self.buf.push(pkt0(reg, 1));
        self.buf.push(value);
        self
    }

    /// Write `values` to consecutive registers starting at `reg` (1 + n dwords).
    pub fn out_reg_seq(&mut self, reg: u32, values: &[u32]) -> &mut Self {
        if values.is_empty() {
            return self;
        }
        self.buf.push(pkt0(reg, values.len() as u32));
        self.buf.extend_from_slice(values);
        self
    }

    /// Write every value of `values` to the same register (1 + n dwords).
    pub fn out_reg_one(&mut self, reg: u32, values: &[u32]) -> &mut Self {
        if values.is_empty() {
            return self;
        }
        self.buf.push(pkt0_one_reg(reg, values.len() as u32));
        self.buf.extend_from_slice(values);
        self
    }

    pub fn out_pkt3(&mut self, opcode: u8, payload: &[u32]) -> &mut Self {
        self.buf.push(pkt3(opcode, payload.len() as u32));
        self.buf.extend_from_slice(payload);
        self
    }

    pub fn out_reloc(&mut self, index: u32) -> &mut Self {
        self.out_pkt3(PKT3_NOP, &[index])
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn finish(self) -> Vec<u32> {
        self.buf
    }
}

/// Raw bit pattern of an `f32` register value.
pub fn f32_bits(value: f32) -> u32 {
    value.to_bits()
}
