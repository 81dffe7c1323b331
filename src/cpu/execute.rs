//! Fetch/decode/execute for the 8080 instruction set.
//!
//! Dispatch is a `match` over the opcode byte; the regular blocks (MOV, the
//! accumulator alu group, INR/DCR/MVI, the register-pair group and the
//! conditional families) decode their operand from the opcode bit fields.
//! Every handler performs its own reads and writes in program order, advances
//! the pc and returns the instruction's fixed tick cost.

use super::{flag, Intel8080};
use crate::controller::Bus;

impl Intel8080 {
    /// Execute one instruction, returning its cost in cpu ticks.
    ///
    /// While halted no fetch is performed and the cost is zero; the machine
    /// keeps polling the i/o controller so an interrupt can resume execution.
    pub(crate) fn execute(&mut self, bus: &mut Bus) -> u8 {
        if self.halted {
            return 0;
        }

        let opcode = bus.read_memory(self.pc);
        self.step(bus, opcode)
    }

    fn step(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        match opcode {
            // The unused encodings degrade to NOP rather than aborting.
            0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 | 0xCB | 0xD9 | 0xDD | 0xED
            | 0xFD => self.nop(),

            0x01 | 0x11 | 0x21 | 0x31 => self.lxi(bus, opcode),
            0x02 | 0x12 => self.stax(bus, opcode),
            0x03 | 0x13 | 0x23 | 0x33 => self.inx(opcode),
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => self.inr(bus, opcode),
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => self.dcr(bus, opcode),
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => self.mvi(bus, opcode),
            0x07 => self.rlc(),
            0x09 | 0x19 | 0x29 | 0x39 => self.dad(opcode),
            0x0A | 0x1A => self.ldax(bus, opcode),
            0x0B | 0x1B | 0x2B | 0x3B => self.dcx(opcode),
            0x0F => self.rrc(),
            0x17 => self.ral(),
            0x1F => self.rar(),
            0x22 => self.shld(bus),
            0x27 => self.daa(),
            0x2A => self.lhld(bus),
            0x2F => self.cma(),
            0x32 => self.sta(bus),
            0x37 => self.stc(),
            0x3A => self.lda(bus),
            0x3F => self.cmc(),

            0x76 => self.hlt(),
            0x40..=0x7F => self.mov(bus, opcode),
            0x80..=0xBF => self.alu(bus, opcode),

            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => self.ret_cc(bus, opcode),
            0xC1 | 0xD1 | 0xE1 => self.pop_rp(bus, opcode),
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => self.jmp_cc(bus, opcode),
            0xC3 => self.jmp(bus),
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => self.call_cc(bus, opcode),
            0xC5 | 0xD5 | 0xE5 => self.push_rp(bus, opcode),
            0xC6 => self.adi(bus),
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => self.rst(bus, opcode),
            0xC9 => self.ret(bus),
            0xCD => self.call(bus),
            0xCE => self.aci(bus),
            0xD3 => self.out(bus),
            0xD6 => self.sui(bus),
            0xDB => self.input(bus),
            0xDE => self.sbi(bus),
            0xE3 => self.xthl(bus),
            0xE6 => self.ani(bus),
            0xE9 => self.pchl(),
            0xEB => self.xchg(),
            0xEE => self.xri(bus),
            0xF1 => self.pop_psw(bus),
            0xF3 => self.di(),
            0xF5 => self.push_psw(bus),
            0xF6 => self.ori(bus),
            0xF9 => self.sphl(),
            0xFB => self.ei(),
            0xFE => self.cpi(bus),
        }
    }

    // ── Operand decoding ──────────────────────────────────────
    //
    // Register operands are encoded as 0..7 = B C D E H L M A, with M the
    // byte addressed by HL. Register pairs as 0..3 = BC DE HL SP.

    fn reg(&self, code: u8) -> u8 {
        match code & 0x07 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            _ => self.a,
        }
    }

    fn set_reg(&mut self, code: u8, value: u8) {
        match code & 0x07 {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 => self.h = value,
            5 => self.l = value,
            _ => self.a = value,
        }
    }

    fn pair(&self, code: u8) -> u16 {
        match code & 0x03 {
            0 => (self.b as u16) << 8 | self.c as u16,
            1 => (self.d as u16) << 8 | self.e as u16,
            2 => self.hl(),
            _ => self.sp,
        }
    }

    fn set_pair(&mut self, code: u8, value: u16) {
        let (hi, lo) = ((value >> 8) as u8, value as u8);

        match code & 0x03 {
            0 => (self.b, self.c) = (hi, lo),
            1 => (self.d, self.e) = (hi, lo),
            2 => (self.h, self.l) = (hi, lo),
            _ => self.sp = value,
        }
    }

    fn condition(&self, code: u8) -> bool {
        match code & 0x07 {
            0 => !self.flag(flag::ZERO),
            1 => self.flag(flag::ZERO),
            2 => !self.flag(flag::CARRY),
            3 => self.flag(flag::CARRY),
            4 => !self.flag(flag::PARITY),
            5 => self.flag(flag::PARITY),
            6 => !self.flag(flag::SIGN),
            _ => self.flag(flag::SIGN),
        }
    }

    /// The 16-bit operand following the current opcode, low byte first.
    fn read_addr(&mut self, bus: &mut Bus) -> u16 {
        let lo = bus.read_memory(self.pc.wrapping_add(1));
        let hi = bus.read_memory(self.pc.wrapping_add(2));
        (hi as u16) << 8 | lo as u16
    }

    /// The 8-bit immediate following the current opcode.
    fn read_imm(&mut self, bus: &mut Bus) -> u8 {
        bus.read_memory(self.pc.wrapping_add(1))
    }

    // ── Data transfer ─────────────────────────────────────────

    fn mov(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let dst = (opcode >> 3) & 0x07;
        let src = opcode & 0x07;

        let ticks = if dst == 6 {
            let value = self.reg(src);
            bus.write_memory(self.hl(), value);
            7
        } else if src == 6 {
            let value = bus.read_memory(self.hl());
            self.set_reg(dst, value);
            7
        } else {
            let value = self.reg(src);
            self.set_reg(dst, value);
            5
        };

        self.pc = self.pc.wrapping_add(1);
        ticks
    }

    fn mvi(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let dst = (opcode >> 3) & 0x07;
        let value = self.read_imm(bus);

        let ticks = if dst == 6 {
            bus.write_memory(self.hl(), value);
            10
        } else {
            self.set_reg(dst, value);
            7
        };

        self.pc = self.pc.wrapping_add(2);
        ticks
    }

    fn lxi(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let value = self.read_addr(bus);
        self.set_pair(opcode >> 4, value);
        self.pc = self.pc.wrapping_add(3);
        10
    }

    fn lda(&mut self, bus: &mut Bus) -> u8 {
        let addr = self.read_addr(bus);
        self.a = bus.read_memory(addr);
        self.pc = self.pc.wrapping_add(3);
        13
    }

    fn sta(&mut self, bus: &mut Bus) -> u8 {
        let addr = self.read_addr(bus);
        bus.write_memory(addr, self.a);
        self.pc = self.pc.wrapping_add(3);
        13
    }

    fn lhld(&mut self, bus: &mut Bus) -> u8 {
        let addr = self.read_addr(bus);
        self.l = bus.read_memory(addr);
        self.h = bus.read_memory(addr.wrapping_add(1));
        self.pc = self.pc.wrapping_add(3);
        16
    }

    fn shld(&mut self, bus: &mut Bus) -> u8 {
        let addr = self.read_addr(bus);
        bus.write_memory(addr, self.l);
        bus.write_memory(addr.wrapping_add(1), self.h);
        self.pc = self.pc.wrapping_add(3);
        16
    }

    fn ldax(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        self.a = bus.read_memory(self.pair(opcode >> 4));
        self.pc = self.pc.wrapping_add(1);
        7
    }

    fn stax(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        bus.write_memory(self.pair(opcode >> 4), self.a);
        self.pc = self.pc.wrapping_add(1);
        7
    }

    fn xchg(&mut self) -> u8 {
        std::mem::swap(&mut self.h, &mut self.d);
        std::mem::swap(&mut self.l, &mut self.e);
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn xthl(&mut self, bus: &mut Bus) -> u8 {
        let lo = bus.read_memory(self.sp);
        let hi = bus.read_memory(self.sp.wrapping_add(1));
        bus.write_memory(self.sp, self.l);
        bus.write_memory(self.sp.wrapping_add(1), self.h);
        self.l = lo;
        self.h = hi;
        self.pc = self.pc.wrapping_add(1);
        18
    }

    // ── 8-bit arithmetic and logic ────────────────────────────

    /// The ADD/ADC/SUB/SBB/ANA/XRA/ORA/CMP block (0x80..0xBF).
    fn alu(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let src = opcode & 0x07;

        let (value, ticks) = if src == 6 {
            (bus.read_memory(self.hl()), 7)
        } else {
            (self.reg(src), 4)
        };

        self.alu_op((opcode >> 3) & 0x07, value);
        self.pc = self.pc.wrapping_add(1);
        ticks
    }

    fn alu_op(&mut self, op: u8, value: u8) {
        match op {
            0 => self.a = self.add(self.a, value, 0, true),
            1 => {
                let carry = self.flag(flag::CARRY) as u8;
                self.a = self.add(self.a, value, carry, true);
            }
            2 => self.a = self.sub(value, 0),
            3 => {
                let borrow = self.flag(flag::CARRY) as u8;
                self.a = self.sub(value, borrow);
            }
            4 => self.and_a(value),
            5 => self.xor_a(value),
            6 => self.or_a(value),
            _ => {
                // CMP: subtract for flags only.
                self.sub(value, 0);
            }
        }
    }

    /// AND into the accumulator. The 8080 derives the aux-carry from bit 3
    /// of the or-ed operands rather than the usual low-nibble sum.
    fn and_a(&mut self, value: u8) {
        self.set_flag(flag::AUX_CARRY, (self.a | value) & 0x08 != 0);
        self.a &= value;
        self.set_flag(flag::CARRY, false);
        self.set_szp(self.a);
    }

    fn xor_a(&mut self, value: u8) {
        self.a ^= value;
        self.set_flag(flag::AUX_CARRY, false);
        self.set_flag(flag::CARRY, false);
        self.set_szp(self.a);
    }

    fn or_a(&mut self, value: u8) {
        self.a |= value;
        self.set_flag(flag::AUX_CARRY, false);
        self.set_flag(flag::CARRY, false);
        self.set_szp(self.a);
    }

    fn adi(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        self.a = self.add(self.a, value, 0, true);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn aci(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        let carry = self.flag(flag::CARRY) as u8;
        self.a = self.add(self.a, value, carry, true);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn sui(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        self.a = self.sub(value, 0);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn sbi(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        let borrow = self.flag(flag::CARRY) as u8;
        self.a = self.sub(value, borrow);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn ani(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        self.and_a(value);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn xri(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        self.xor_a(value);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn ori(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        self.or_a(value);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn cpi(&mut self, bus: &mut Bus) -> u8 {
        let value = self.read_imm(bus);
        self.sub(value, 0);
        self.pc = self.pc.wrapping_add(2);
        7
    }

    fn inr(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let dst = (opcode >> 3) & 0x07;

        let ticks = if dst == 6 {
            let addr = self.hl();
            let value = bus.read_memory(addr);
            let value = self.add(value, 0x01, 0, false);
            bus.write_memory(addr, value);
            10
        } else {
            let value = self.add(self.reg(dst), 0x01, 0, false);
            self.set_reg(dst, value);
            5
        };

        self.pc = self.pc.wrapping_add(1);
        ticks
    }

    fn dcr(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let dst = (opcode >> 3) & 0x07;

        // Two's-complement add; carry is left untouched.
        let ticks = if dst == 6 {
            let addr = self.hl();
            let value = bus.read_memory(addr);
            let value = self.add(value, 0xFF, 0, false);
            bus.write_memory(addr, value);
            10
        } else {
            let value = self.add(self.reg(dst), 0xFF, 0, false);
            self.set_reg(dst, value);
            5
        };

        self.pc = self.pc.wrapping_add(1);
        ticks
    }

    fn cma(&mut self) -> u8 {
        self.a = !self.a;
        self.pc = self.pc.wrapping_add(1);
        4
    }

    /// Decimal adjust: fold the binary accumulator into two BCD digits.
    fn daa(&mut self) -> u8 {
        let mut adjustment = 0u8;
        let high = self.a >> 4;
        let low = self.a & 0x0F;

        if low > 9 || self.flag(flag::AUX_CARRY) {
            adjustment += 0x06;
        }

        if high > 9 || self.flag(flag::CARRY) || (high >= 9 && low > 9) {
            adjustment += 0x60;
            self.set_flag(flag::CARRY, true);
        }

        self.a = self.add(self.a, adjustment, 0, false);
        self.pc = self.pc.wrapping_add(1);
        4
    }

    // ── 16-bit arithmetic ─────────────────────────────────────

    fn dad(&mut self, opcode: u8) -> u8 {
        let sum = self.hl() as u32 + self.pair(opcode >> 4) as u32;
        self.h = (sum >> 8) as u8;
        self.l = sum as u8;
        self.set_flag(flag::CARRY, sum > 0xFFFF);
        self.pc = self.pc.wrapping_add(1);
        10
    }

    fn inx(&mut self, opcode: u8) -> u8 {
        let pair = opcode >> 4;
        self.set_pair(pair, self.pair(pair).wrapping_add(1));
        self.pc = self.pc.wrapping_add(1);
        5
    }

    fn dcx(&mut self, opcode: u8) -> u8 {
        let pair = opcode >> 4;
        self.set_pair(pair, self.pair(pair).wrapping_sub(1));
        self.pc = self.pc.wrapping_add(1);
        5
    }

    // ── Rotates and carry ─────────────────────────────────────

    fn rlc(&mut self) -> u8 {
        self.set_flag(flag::CARRY, self.a & 0x80 != 0);
        self.a = self.a.rotate_left(1);
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn rrc(&mut self) -> u8 {
        self.set_flag(flag::CARRY, self.a & 0x01 != 0);
        self.a = self.a.rotate_right(1);
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn ral(&mut self) -> u8 {
        let carry_in = self.flag(flag::CARRY) as u8;
        self.set_flag(flag::CARRY, self.a & 0x80 != 0);
        self.a = self.a << 1 | carry_in;
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn rar(&mut self) -> u8 {
        let carry_in = self.flag(flag::CARRY) as u8;
        self.set_flag(flag::CARRY, self.a & 0x01 != 0);
        self.a = self.a >> 1 | carry_in << 7;
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn stc(&mut self) -> u8 {
        self.set_flag(flag::CARRY, true);
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn cmc(&mut self) -> u8 {
        self.status ^= flag::CARRY;
        self.pc = self.pc.wrapping_add(1);
        4
    }

    // ── Control flow ──────────────────────────────────────────

    fn jmp(&mut self, bus: &mut Bus) -> u8 {
        let addr = self.read_addr(bus);
        self.pc = addr;
        10
    }

    /// Conditional jump; 10 ticks regardless of the branch taken.
    fn jmp_cc(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let addr = self.read_addr(bus);

        if self.condition(opcode >> 3) {
            self.pc = addr;
        } else {
            self.pc = self.pc.wrapping_add(3);
        }

        10
    }

    fn call(&mut self, bus: &mut Bus) -> u8 {
        let addr = self.read_addr(bus);
        let ret = self.pc.wrapping_add(3);
        self.push_word(bus, ret);
        self.pc = addr;
        17
    }

    fn call_cc(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let addr = self.read_addr(bus);

        if self.condition(opcode >> 3) {
            let ret = self.pc.wrapping_add(3);
            self.push_word(bus, ret);
            self.pc = addr;
            17
        } else {
            self.pc = self.pc.wrapping_add(3);
            11
        }
    }

    fn ret(&mut self, bus: &mut Bus) -> u8 {
        self.pc = self.pop_word(bus);
        10
    }

    fn ret_cc(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        if self.condition(opcode >> 3) {
            self.pc = self.pop_word(bus);
            11
        } else {
            self.pc = self.pc.wrapping_add(1);
            5
        }
    }

    /// The RST instruction: return address is the following instruction.
    fn rst(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let ret = self.pc.wrapping_add(1);
        self.push_word(bus, ret);
        self.pc = (opcode & 0x38) as u16;
        11
    }

    fn pchl(&mut self) -> u8 {
        self.pc = self.hl();
        5
    }

    fn sphl(&mut self) -> u8 {
        self.sp = self.hl();
        self.pc = self.pc.wrapping_add(1);
        5
    }

    // ── Stack ─────────────────────────────────────────────────

    fn push_rp(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let value = self.pair((opcode >> 4) & 0x03);
        self.push_word(bus, value);
        self.pc = self.pc.wrapping_add(1);
        11
    }

    fn pop_rp(&mut self, bus: &mut Bus, opcode: u8) -> u8 {
        let value = self.pop_word(bus);
        self.set_pair((opcode >> 4) & 0x03, value);
        self.pc = self.pc.wrapping_add(1);
        10
    }

    fn push_psw(&mut self, bus: &mut Bus) -> u8 {
        let psw = (self.a as u16) << 8 | self.status as u16;
        self.push_word(bus, psw);
        self.pc = self.pc.wrapping_add(1);
        11
    }

    fn pop_psw(&mut self, bus: &mut Bus) -> u8 {
        let psw = self.pop_word(bus);
        self.a = (psw >> 8) as u8;
        // The fixed status bits survive whatever was pushed.
        self.status = (psw as u8 & flag::MASK) | flag::FIXED;
        self.pc = self.pc.wrapping_add(1);
        10
    }

    // ── I/O, interrupt control, nop/halt ──────────────────────

    fn out(&mut self, bus: &mut Bus) -> u8 {
        let port = self.read_imm(bus);
        bus.write_io(port as u16, self.a);
        self.pc = self.pc.wrapping_add(2);
        10
    }

    fn input(&mut self, bus: &mut Bus) -> u8 {
        let port = self.read_imm(bus);
        self.a = bus.read_io(port as u16);
        self.pc = self.pc.wrapping_add(2);
        10
    }

    fn ei(&mut self) -> u8 {
        self.iff = true;
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn di(&mut self) -> u8 {
        self.iff = false;
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn nop(&mut self) -> u8 {
        self.pc = self.pc.wrapping_add(1);
        4
    }

    fn hlt(&mut self) -> u8 {
        self.halted = true;
        self.pc = self.pc.wrapping_add(1);
        7
    }
}
