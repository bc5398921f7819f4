//! Packet header encoding and a validating stream decoder.

use thiserror::Error;

pub const PACKET_TYPE_SHIFT: u32 = 30;
pub const PACKET_TYPE_0: u32 = 0;
pub const PACKET_TYPE_3: u32 = 3;

const COUNT_SHIFT: u32 = 16;
const COUNT_MASK: u32 = 0x3FFF;
const PKT0_REG_MASK: u32 = 0x1FFF;
/// Type-0 flag: write every value to the same register instead of consecutive ones.
pub const PKT0_ONE_REG_WR: u32 = 1 << 15;
const PKT3_OPCODE_SHIFT: u32 = 8;

pub const PKT3_NOP: u8 = 0x10;
pub const PKT3_3D_LOAD_VBPNTR: u8 = 0x2F;
pub const PKT3_3D_CLEAR_ZMASK: u8 = 0x32;
pub const PKT3_3D_DRAW_VBUF_2: u8 = 0x34;
pub const PKT3_3D_DRAW_IMMD_2: u8 = 0x35;
pub const PKT3_3D_DRAW_INDX_2: u8 = 0x36;
pub const PKT3_3D_CLEAR_HIZ: u8 = 0x37;
pub const PKT3_3D_CLEAR_COLOR: u8 = 0x38;

/// Largest payload a single packet header can describe.
pub const MAX_PACKET_DWORDS: usize = COUNT_MASK as usize + 1;

/// Header for a type-0 packet writing `count` consecutive registers starting at `reg`.
pub const fn pkt0(reg: u32, count: u32) -> u32 {
    assert!(count > 0 && count - 1 <= COUNT_MASK);
    (PACKET_TYPE_0 << PACKET_TYPE_SHIFT) | ((count - 1) << COUNT_SHIFT) | ((reg >> 2) & PKT0_REG_MASK)
}

/// Header for a type-0 packet writing `count` values to the single register `reg`.
pub const fn pkt0_one_reg(reg: u32, count: u32) -> u32 {
    pkt0(reg, count) | PKT0_ONE_REG_WR
}

/// Header for a type-3 packet carrying `count` payload dwords.
pub const fn pkt3(opcode: u8, count: u32) -> u32 {
    assert!(count > 0 && count - 1 <= COUNT_MASK);
    (PACKET_TYPE_3 << PACKET_TYPE_SHIFT)
        | ((count - 1) << COUNT_SHIFT)
        | ((opcode as u32) << PKT3_OPCODE_SHIFT)
}

/// Dwords occupied by a relocation marker.
pub const RELOC_DWORDS: u32 = 2;

/// Decoded view of a single packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    RegWrite {
        reg: u32,
        one_reg: bool,
        values: Vec<u32>,
    },
    /// Relocation marker: index into the submission's relocation list.
    Reloc { index: u32 },
    Type3 { opcode: u8, payload: Vec<u32> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PacketDecodeError {
    #[error("packet at dword {offset} needs {needed} dwords but only {available} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("unsupported packet type {packet_type} at dword {offset}")]
    UnsupportedType { offset: usize, packet_type: u32 },
}

/// Decode a dword stream into packets.
pub fn decode_packets(dwords: &[u32]) -> Result<Vec<Packet>, PacketDecodeError> {
    let mut packets = Vec::new();
    let mut cursor = 0usize;

    while cursor < dwords.len() {
        let header = dwords[cursor];
        let packet_type = header >> PACKET_TYPE_SHIFT;
        if packet_type != PACKET_TYPE_0 && packet_type != PACKET_TYPE_3 {
            return Err(PacketDecodeError::UnsupportedType {
                offset: cursor,
                packet_type,
            });
        }
        let count = (((header >> COUNT_SHIFT) & COUNT_MASK) + 1) as usize;

        let available = dwords.len() - cursor - 1;
        if count > available {
            return Err(PacketDecodeError::Truncated {
                offset: cursor,
                needed: count + 1,
                available: available + 1,
            });
        }
        let payload = &dwords[cursor + 1..cursor + 1 + count];

        if packet_type == PACKET_TYPE_0 {
            packets.push(Packet::RegWrite {
                reg: (header & PKT0_REG_MASK) << 2,
                one_reg: header & PKT0_ONE_REG_WR != 0,
                values: payload.to_vec(),
            });
        } else {
            let opcode = ((header >> PKT3_OPCODE_SHIFT) & 0xFF) as u8;
            if opcode == PKT3_NOP && count == 1 {
                packets.push(Packet::Reloc { index: payload[0] });
            } else {
                packets.push(Packet::Type3 {
                    opcode,
                    payload: payload.to_vec(),
                });
            }
        }

        cursor += 1 + count;
    }

    Ok(packets)
}

/// Flatten every type-0 packet of `dwords` into `(register, value)` pairs in stream order.
pub fn register_writes(dwords: &[u32]) -> Result<Vec<(u32, u32)>, PacketDecodeError> {
    let mut writes = Vec::new();
    for packet in decode_packets(dwords)? {
        if let Packet::RegWrite {
            reg,
            one_reg,
            values,
        } = packet
        {
            for (i, value) in values.into_iter().enumerate() {
                let target = if one_reg { reg } else { reg + 4 * i as u32 };
                writes.push((target, value));
            }
        }
    }
    Ok(writes)
}
