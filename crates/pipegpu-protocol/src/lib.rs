//! Wire format shared by the `pipegpu` driver core and its tooling.
//!
//! The command stream consumed by the device is a flat sequence of little-endian dwords made of
//! two packet kinds:
//! - type-0 packets: a header naming a register (or a run of consecutive registers) followed by
//!   the values to write, and
//! - type-3 packets: an opcode header followed by an opcode-specific payload (draw calls,
//!   clears, and relocation markers).
//!
//! [`regs`] names every register the driver writes, [`packet`] encodes/decodes packet headers,
//! and [`cmd_writer::RegWriter`] builds unbudgeted dword blocks for pre-recorded state and tests.
#![forbid(unsafe_code)]

pub mod cmd_writer;
pub mod packet;
pub mod regs;

pub use cmd_writer::RegWriter;
pub use packet::{decode_packets, register_writes, Packet, PacketDecodeError, MAX_PACKET_DWORDS};
