//! The Intel 8080 interpreter.
//!
//! The cpu is a pure interpreter over the controller pair: it owns nothing
//! but its register file and issues every memory and port access through the
//! [`Bus`] handed to [`Intel8080::execute`]. One call executes exactly one
//! instruction and returns its fixed tick cost.

mod execute;
#[cfg(test)]
mod tests;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::controller::{Bus, Isr};
use crate::error::Error;
use crate::transcode;

/// Status register bit masks: `S Z 0 AC 0 P 1 C`.
///
/// Bit 1 is always one, bits 3 and 5 always zero.
pub(crate) mod flag {
    pub const CARRY: u8 = 0x01;
    pub const FIXED: u8 = 0x02;
    pub const PARITY: u8 = 0x04;
    pub const AUX_CARRY: u8 = 0x10;
    pub const ZERO: u8 = 0x40;
    pub const SIGN: u8 = 0x80;

    /// The writable flag bits; everything else is forced on restore.
    pub const MASK: u8 = 0xD7;
}

/// Stable identity of this cpu model, recorded in snapshots.
const UUID: Uuid = Uuid::from_bytes([
    0x3B, 0xE8, 0x4F, 0x1F, 0x9D, 0x7A, 0x4B, 0x70, 0xA5, 0x45, 0xD9, 0xF3, 0x49, 0x12, 0xFC,
    0xAD,
]);

/// The seven working registers, the status register, pc/sp and the two
/// control flip-flops.
pub(crate) struct Intel8080 {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub status: u8,
    pub pc: u16,
    pub sp: u16,
    /// Interrupt flip-flop: set by EI, cleared by DI and by interrupt
    /// acceptance.
    pub iff: bool,
    /// Set by HLT; while halted `execute` performs no fetch and costs zero
    /// ticks. Cleared by an accepted interrupt.
    pub halted: bool,
}

/// The `registers` subtree of the snapshot cpu state.
#[derive(Serialize)]
struct Registers {
    a: u8,
    b: u8,
    c: u8,
    d: u8,
    e: u8,
    h: u8,
    l: u8,
    s: u8,
}

/// The full snapshot cpu state, in wire key order.
#[derive(Serialize)]
struct CpuState {
    uuid: String,
    registers: Registers,
    pc: u16,
    sp: u16,
}

impl Intel8080 {
    pub fn new() -> Self {
        Intel8080 {
            a: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            status: flag::FIXED,
            pc: 0,
            sp: 0,
            iff: false,
            halted: false,
        }
    }

    /// Power-on state: registers and pc/sp zeroed, interrupts disabled.
    pub fn reset(&mut self) {
        self.a = 0;
        self.b = 0;
        self.c = 0;
        self.d = 0;
        self.e = 0;
        self.h = 0;
        self.l = 0;
        self.status = flag::FIXED;
        self.pc = 0;
        self.sp = 0;
        self.iff = false;
        self.halted = false;
    }

    // ── Flags ─────────────────────────────────────────────────

    pub(crate) fn flag(&self, mask: u8) -> bool {
        self.status & mask != 0
    }

    fn set_flag(&mut self, mask: u8, on: bool) {
        if on {
            self.status |= mask;
        } else {
            self.status &= !mask;
        }
    }

    /// Sign, zero and parity from a result byte.
    fn set_szp(&mut self, value: u8) {
        self.set_flag(flag::SIGN, value & 0x80 != 0);
        self.set_flag(flag::ZERO, value == 0);
        self.set_flag(flag::PARITY, value.count_ones() % 2 == 0);
    }

    /// The shared flag engine for 8-bit adds. Subtraction is routed through
    /// here as an inverted-addend add and the caller flips the carry flag to
    /// restore the 8080 borrow convention.
    fn add(&mut self, lhs: u8, rhs: u8, carry_in: u8, set_carry: bool) -> u8 {
        let sum = lhs as u16 + rhs as u16 + carry_in as u16;

        if set_carry {
            self.set_flag(flag::CARRY, sum > 0xFF);
        }

        self.set_flag(
            flag::AUX_CARRY,
            (lhs & 0x0F) + (rhs & 0x0F) + carry_in > 0x0F,
        );

        let result = sum as u8;
        self.set_szp(result);
        result
    }

    /// `A - rhs - borrow_in`, computed as `A + !rhs + (1 - borrow_in)`.
    fn sub(&mut self, rhs: u8, borrow_in: u8) -> u8 {
        let result = self.add(self.a, !rhs, 1 - borrow_in, true);
        self.status ^= flag::CARRY;
        result
    }

    // ── Register pairs / stack ────────────────────────────────

    pub(crate) fn hl(&self) -> u16 {
        (self.h as u16) << 8 | self.l as u16
    }

    fn push_word(&mut self, bus: &mut Bus, value: u16) {
        self.sp = self.sp.wrapping_sub(1);
        bus.write_memory(self.sp, (value >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        bus.write_memory(self.sp, value as u8);
    }

    fn pop_word(&mut self, bus: &mut Bus) -> u16 {
        let lo = bus.read_memory(self.sp);
        self.sp = self.sp.wrapping_add(1);
        let hi = bus.read_memory(self.sp);
        self.sp = self.sp.wrapping_add(1);
        (hi as u16) << 8 | lo as u16
    }

    // ── Interrupts ────────────────────────────────────────────

    /// Acknowledge a hardware interrupt by injecting `RST n`.
    ///
    /// The return address pushed is the current pc (the instruction that was
    /// about to execute). Acceptance clears the interrupt flip-flop and any
    /// halt. Returns the tick cost, or 0 when the interrupt is dropped
    /// (machine-level isr value, or interrupts disabled).
    pub fn interrupt(&mut self, isr: Isr, bus: &mut Bus) -> u8 {
        let vector = match isr.vector() {
            Some(v) => v,
            None => return 0,
        };

        if !self.iff {
            return 0;
        }

        self.iff = false;
        self.halted = false;
        let pc = self.pc;
        self.push_word(bus, pc);
        self.pc = vector as u16 * 8;
        11
    }

    // ── Snapshot ──────────────────────────────────────────────

    /// The cpu subtree of a machine snapshot.
    pub fn save(&self) -> Result<String, Error> {
        let state = CpuState {
            uuid: format!(
                "base64://{}",
                transcode::bin_to_txt("base64", "none", UUID.as_bytes())?
            ),
            registers: Registers {
                a: self.a,
                b: self.b,
                c: self.c,
                d: self.d,
                e: self.e,
                h: self.h,
                l: self.l,
                s: self.status,
            },
            pc: self.pc,
            sp: self.sp,
        };

        serde_json::to_string(&state).map_err(|e| Error::JsonParse(e.to_string()))
    }

    /// Restore the cpu from the `cpu` subtree of a snapshot.
    ///
    /// Fields may be partial; absent ones keep their current values. All
    /// present fields are validated before any assignment, so an error leaves
    /// the cpu unmodified. The uuid is verified only when `check_uuid` is set
    /// (the machine sets it when the snapshot also restores ram).
    pub fn load(&mut self, json: &Value, check_uuid: bool) -> Result<(), Error> {
        if check_uuid {
            let uuid = json
                .get("uuid")
                .and_then(Value::as_str)
                .ok_or(Error::IncompatibleUuid)?;
            let b64 = uuid
                .strip_prefix("base64://")
                .ok_or_else(|| Error::UriScheme(uuid.into()))?;
            let bytes = transcode::txt_to_bin("base64", "none", b64)
                .map_err(|_| Error::IncompatibleUuid)?;

            if bytes != UUID.as_bytes() {
                return Err(Error::IncompatibleUuid);
            }
        }

        let regs = json.get("registers");
        let a = u8_field(regs, "a", self.a)?;
        let b = u8_field(regs, "b", self.b)?;
        let c = u8_field(regs, "c", self.c)?;
        let d = u8_field(regs, "d", self.d)?;
        let e = u8_field(regs, "e", self.e)?;
        let h = u8_field(regs, "h", self.h)?;
        let l = u8_field(regs, "l", self.l)?;
        let s = u8_field(regs, "s", self.status)?;
        let pc = u16_field(json, "pc", self.pc)?;
        let sp = u16_field(json, "sp", self.sp)?;

        self.a = a;
        self.b = b;
        self.c = c;
        self.d = d;
        self.e = e;
        self.h = h;
        self.l = l;
        self.status = (s & flag::MASK) | flag::FIXED;
        self.pc = pc;
        self.sp = sp;
        Ok(())
    }
}

fn u8_field(obj: Option<&Value>, key: &str, current: u8) -> Result<u8, Error> {
    match obj.and_then(|o| o.get(key)) {
        None => Ok(current),
        Some(v) => v
            .as_u64()
            .filter(|n| *n <= u8::MAX as u64)
            .map(|n| n as u8)
            .ok_or_else(|| Error::JsonParse(format!("bad cpu register value for {key}"))),
    }
}

fn u16_field(obj: &Value, key: &str, current: u16) -> Result<u16, Error> {
    match obj.get(key) {
        None => Ok(current),
        Some(v) => v
            .as_u64()
            .filter(|n| *n <= u16::MAX as u64)
            .map(|n| n as u16)
            .ok_or_else(|| Error::JsonParse(format!("bad cpu field value for {key}"))),
    }
}
