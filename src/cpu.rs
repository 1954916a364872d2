// The chip behind the NINTENDO GAME BOY: the sharp LR35902. The interpreter executes whole
// instructions and posts their cycle cost as a lump: the caller hands it a cycle budget via
// run_sync, and for every cycle consumed the APU is stepped while the divider/timer and the
// interrupt dispatcher run on a four cycle grain.
use super::debug;
use super::memory::Memory;
use super::mmu::Mmu;
use super::register::Flag::{C, H, N, Z};
use super::register::Register;
use bincode::{Decode, Encode};

// Cycle cost per opcode. Conditional jumps, calls and returns hold their not-taken cost here;
// the taken path adds its surcharge in ex(). Holes are the eleven unusable opcodes.
//  0   1   2   3   4   5   6   7   8   9   a   b   c   d   e   f
const OP_CYCLES: [u32; 256] = [
    4, 12, 8, 8, 4, 4, 8, 4, 20, 8, 8, 8, 4, 4, 8, 4, // 0
    4, 12, 8, 8, 4, 4, 8, 4, 12, 8, 8, 8, 4, 4, 8, 4, // 1
    8, 12, 8, 8, 4, 4, 8, 4, 8, 8, 8, 8, 4, 4, 8, 4, // 2
    8, 12, 8, 8, 12, 12, 12, 4, 8, 8, 8, 8, 4, 4, 8, 4, // 3
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4, // 4
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4, // 5
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4, // 6
    8, 8, 8, 8, 8, 8, 4, 8, 4, 4, 4, 4, 4, 4, 8, 4, // 7
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4, // 8
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4, // 9
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4, // a
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4, // b
    8, 12, 12, 16, 12, 16, 8, 16, 8, 16, 12, 4, 12, 24, 8, 16, // c
    8, 12, 12, 0, 12, 16, 8, 16, 8, 16, 12, 0, 12, 0, 8, 16, // d
    12, 12, 8, 0, 0, 16, 8, 16, 16, 4, 16, 0, 0, 0, 8, 16, // e
    12, 12, 8, 4, 0, 16, 8, 16, 12, 8, 16, 4, 0, 0, 8, 16, // f
];

//  0   1   2   3   4   5   6   7   8   9   a   b   c   d   e   f
const CB_CYCLES: [u32; 256] = [
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // 0
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // 1
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // 2
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // 3
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8, // 4
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8, // 5
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8, // 6
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8, // 7
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // 8
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // 9
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // a
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // b
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // c
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // d
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // e
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8, // f
];

// Interrupt handler entry points for IF bits 0 through 4.
const HANDLER_ADDRESSES: [u16; 5] = [0x40, 0x48, 0x50, 0x58, 0x60];

// A HALT can leave the cpu in one of three suspended shapes besides plain running:
//   - Halted: IME set, wake through the normal interrupt dispatcher.
//   - HaltedNoIme: IME clear, wake on a pending interrupt but do not jump to its handler.
//   - HaltBug: HALT with IME clear while an interrupt is already pending does not suspend at
//     all. The opcode after the HALT is fetched without advancing PC, so it executes twice.
#[derive(Clone, Copy, Debug, Decode, Encode, Eq, PartialEq)]
pub enum HaltMode {
    Running,
    Halted,
    HaltedNoIme,
    HaltBug,
}

pub struct Cpu {
    pub reg: Register,
    pub ime: bool,
    pub halt_mode: HaltMode,
    // Machine cycle counter. Its low 16 bits drive the divider and timer registers.
    pub cycle_counter: u64,
    // Leftover budget from the previous run_sync call. Work is posted in whole instructions, so
    // each call overshoots by a few cycles which are rolled forward here.
    balance: i64,
    pub trace: bool,
}

impl Cpu {
    pub fn power_up() -> Self {
        Self {
            reg: Register::power_up(),
            ime: false,
            halt_mode: HaltMode::Running,
            cycle_counter: 0,
            balance: 0,
            trace: false,
        }
    }

    // Advance by approximately `budget` cycles.
    pub fn run_sync(&mut self, mem: &mut Mmu, budget: u32) {
        self.balance += i64::from(budget);
        while self.balance > 0 {
            if self.trace && matches!(self.halt_mode, HaltMode::Running | HaltMode::HaltBug) {
                debug::trace(self, mem);
            }
            self.service_interrupts(mem);
            let cycles = match self.halt_mode {
                HaltMode::Halted | HaltMode::HaltedNoIme => 4,
                _ => self.ex(mem),
            };
            mem.step_apu(cycles);
            let mut n = cycles;
            while n >= 4 {
                n -= 4;
                self.cycle_counter += 4;
                self.timer_tick(mem);
            }
            self.balance -= i64::from(cycles);
        }
    }

    // Interrupt priority runs from IF bit 0 (vblank) to bit 4 (joypad). A pending interrupt
    // always wakes a halted cpu, but only dispatches to its handler when IME is set.
    fn service_interrupts(&mut self, mem: &mut Mmu) {
        let pending = mem.get(0xff0f) & mem.get(0xffff) & 0x1f;
        if self.halt_mode == HaltMode::HaltedNoIme {
            if pending != 0x00 {
                self.halt_mode = HaltMode::Running;
            }
            return;
        }
        if !self.ime || pending == 0x00 {
            return;
        }
        let n = pending.trailing_zeros() as usize;
        self.ime = false;
        mem.set(0xff0f, mem.get(0xff0f) & !(1 << n));
        self.stack_push(mem, self.reg.pc);
        self.reg.pc = HANDLER_ADDRESSES[n];
        self.halt_mode = HaltMode::Running;
    }

    // Runs once per four cycle sub-tick. DIV is the high byte of the cycle counter; TIMA ticks
    // whenever the counter crosses a multiple of the period selected by TAC.
    fn timer_tick(&mut self, mem: &mut Mmu) {
        mem.ram[0xff04] = (self.cycle_counter >> 8) as u8;
        let tac = mem.ram[0xff07];
        if tac & 0x04 == 0x00 {
            return;
        }
        let period = [1024, 16, 64, 256][usize::from(tac & 0x03)];
        if self.cycle_counter % period != 0 {
            return;
        }
        let tima = mem.ram[0xff05].wrapping_add(1);
        if tima == 0x00 {
            mem.ram[0xff05] = mem.ram[0xff06];
            mem.ram[0xff0f] |= 0x04;
        } else {
            mem.ram[0xff05] = tima;
        }
    }

    fn imm(&mut self, mem: &mut Mmu) -> u8 {
        let v = mem.get(self.reg.pc);
        self.reg.pc = self.reg.pc.wrapping_add(1);
        v
    }

    fn imm_word(&mut self, mem: &mut Mmu) -> u16 {
        let v = mem.get_word(self.reg.pc);
        self.reg.pc = self.reg.pc.wrapping_add(2);
        v
    }

    // The high byte goes out first at SP-1, then the low byte at SP-2.
    fn stack_push(&mut self, mem: &mut Mmu, v: u16) {
        self.reg.sp = self.reg.sp.wrapping_sub(2);
        mem.set_word(self.reg.sp, v);
    }

    fn stack_pop(&mut self, mem: &mut Mmu) -> u16 {
        let v = mem.get_word(self.reg.sp);
        self.reg.sp = self.reg.sp.wrapping_add(2);
        v
    }

    // Operand lookup for the row/column encoded register slots B,C,D,E,H,L,(HL),A.
    fn get_r(&mut self, mem: &mut Mmu, i: u8) -> u8 {
        match i {
            0 => self.reg.b,
            1 => self.reg.c,
            2 => self.reg.d,
            3 => self.reg.e,
            4 => self.reg.h,
            5 => self.reg.l,
            6 => mem.get(self.reg.get_hl()),
            _ => self.reg.a,
        }
    }

    fn set_r(&mut self, mem: &mut Mmu, i: u8, v: u8) {
        match i {
            0 => self.reg.b = v,
            1 => self.reg.c = v,
            2 => self.reg.d = v,
            3 => self.reg.e = v,
            4 => self.reg.h = v,
            5 => self.reg.l = v,
            6 => mem.set(self.reg.get_hl(), v),
            _ => self.reg.a = v,
        }
    }
}

// ALU helpers. Flag effects follow the opcode reference; in particular ADC and SBC fold the
// carry into the half carry and carry computation as a third addend, and DAA replays the
// N/H/C flags recorded by the preceding add or subtract.
impl Cpu {
    fn alu_add(&mut self, n: u8) {
        let a = self.reg.a;
        let r = a.wrapping_add(n);
        self.reg.set_flag(C, u16::from(a) + u16::from(n) > 0xff);
        self.reg.set_flag(H, (a & 0x0f) + (n & 0x0f) > 0x0f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    fn alu_adc(&mut self, n: u8) {
        let a = self.reg.a;
        let c = u8::from(self.reg.get_flag(C));
        let r = a.wrapping_add(n).wrapping_add(c);
        self.reg.set_flag(C, u16::from(a) + u16::from(n) + u16::from(c) > 0xff);
        self.reg.set_flag(H, (a & 0x0f) + (n & 0x0f) + c > 0x0f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    fn alu_sub(&mut self, n: u8) {
        let a = self.reg.a;
        let r = a.wrapping_sub(n);
        self.reg.set_flag(C, u16::from(a) < u16::from(n));
        self.reg.set_flag(H, (a & 0x0f) < (n & 0x0f));
        self.reg.set_flag(N, true);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    fn alu_sbc(&mut self, n: u8) {
        let a = self.reg.a;
        let c = u8::from(self.reg.get_flag(C));
        let r = a.wrapping_sub(n).wrapping_sub(c);
        self.reg.set_flag(C, u16::from(a) < u16::from(n) + u16::from(c));
        self.reg.set_flag(H, (a & 0x0f) < (n & 0x0f) + c);
        self.reg.set_flag(N, true);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    fn alu_and(&mut self, n: u8) {
        let r = self.reg.a & n;
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, true);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    fn alu_xor(&mut self, n: u8) {
        let r = self.reg.a ^ n;
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    fn alu_or(&mut self, n: u8) {
        let r = self.reg.a | n;
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        self.reg.a = r;
    }

    // CP is a SUB that throws the result away.
    fn alu_cp(&mut self, n: u8) {
        let a = self.reg.a;
        self.alu_sub(n);
        self.reg.a = a;
    }

    fn alu_inc(&mut self, a: u8) -> u8 {
        let r = a.wrapping_add(1);
        self.reg.set_flag(H, (a & 0x0f) + 0x01 > 0x0f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_dec(&mut self, a: u8) -> u8 {
        let r = a.wrapping_sub(1);
        self.reg.set_flag(H, a & 0x0f == 0x00);
        self.reg.set_flag(N, true);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    // ADD HL,rr leaves Z untouched; H is the carry out of bit 11, C out of bit 15.
    fn alu_add_hl(&mut self, n: u16) {
        let a = self.reg.get_hl();
        let r = a.wrapping_add(n);
        self.reg.set_flag(C, a > 0xffff - n);
        self.reg.set_flag(H, (a & 0x07ff) + (n & 0x07ff) > 0x07ff);
        self.reg.set_flag(N, false);
        self.reg.set_hl(r);
    }

    // Shared by ADD SP,r8 and LD HL,SP+r8: flags come from unsigned byte addition of the low
    // bytes, Z and N are always cleared.
    fn alu_add_sp(&mut self, mem: &mut Mmu) -> u16 {
        let a = self.reg.sp;
        let b = i16::from(self.imm(mem) as i8) as u16;
        self.reg.set_flag(C, (a & 0x00ff) + (b & 0x00ff) > 0x00ff);
        self.reg.set_flag(H, (a & 0x000f) + (b & 0x000f) > 0x000f);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, false);
        a.wrapping_add(b)
    }

    // Post-adjust A to binary coded decimal after an add or subtract, using the N/H/C flags the
    // operation left behind.
    fn alu_daa(&mut self) {
        let mut a = self.reg.a;
        let mut adjust = if self.reg.get_flag(C) { 0x60 } else { 0x00 };
        if self.reg.get_flag(H) {
            adjust |= 0x06;
        }
        if !self.reg.get_flag(N) {
            if a & 0x0f > 0x09 {
                adjust |= 0x06;
            }
            if a > 0x99 {
                adjust |= 0x60;
            }
            a = a.wrapping_add(adjust);
        } else {
            a = a.wrapping_sub(adjust);
        }
        self.reg.set_flag(C, adjust >= 0x60);
        self.reg.set_flag(H, false);
        self.reg.set_flag(Z, a == 0x00);
        self.reg.a = a;
    }

    fn alu_rlc(&mut self, a: u8) -> u8 {
        let c = a >> 7;
        let r = (a << 1) | c;
        self.reg.set_flag(C, c != 0x00);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_rl(&mut self, a: u8) -> u8 {
        let r = (a << 1) | u8::from(self.reg.get_flag(C));
        self.reg.set_flag(C, a & 0x80 != 0x00);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_rrc(&mut self, a: u8) -> u8 {
        let c = a & 0x01;
        let r = (a >> 1) | (c << 7);
        self.reg.set_flag(C, c != 0x00);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_rr(&mut self, a: u8) -> u8 {
        let r = (a >> 1) | (u8::from(self.reg.get_flag(C)) << 7);
        self.reg.set_flag(C, a & 0x01 != 0x00);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_sla(&mut self, a: u8) -> u8 {
        let r = a << 1;
        self.reg.set_flag(C, a & 0x80 != 0x00);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_sra(&mut self, a: u8) -> u8 {
        let r = (a >> 1) | (a & 0x80);
        self.reg.set_flag(C, a & 0x01 != 0x00);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_srl(&mut self, a: u8) -> u8 {
        let r = a >> 1;
        self.reg.set_flag(C, a & 0x01 != 0x00);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    fn alu_swap(&mut self, a: u8) -> u8 {
        let r = (a >> 4) | (a << 4);
        self.reg.set_flag(C, false);
        self.reg.set_flag(H, false);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, r == 0x00);
        r
    }

    // BIT leaves C alone; Z is the complement of the tested bit.
    fn alu_bit(&mut self, a: u8, b: u8) {
        self.reg.set_flag(H, true);
        self.reg.set_flag(N, false);
        self.reg.set_flag(Z, a & (1 << b) == 0x00);
    }

    fn jump_relative(&mut self, mem: &mut Mmu) {
        let n = self.imm(mem) as i8;
        self.reg.pc = self.reg.pc.wrapping_add(n as u16);
    }
}

impl Cpu {
    // Decode and execute one instruction, returning its cycle cost. The grid splits into four
    // quadrants: rows 0-3 are a grab bag, rows 4-7 are the register to register loads, rows 8-B
    // the accumulator ALU block and rows C-F control flow and the high page accesses.
    fn ex(&mut self, mem: &mut Mmu) -> u32 {
        let opcode = match self.halt_mode {
            // The byte after the HALT is read without moving PC, so it will be fetched again.
            HaltMode::HaltBug => {
                self.halt_mode = HaltMode::Running;
                mem.get(self.reg.pc)
            }
            _ => self.imm(mem),
        };
        let mut taken = false;
        match opcode {
            0x00 => {}
            0x01 => {
                let v = self.imm_word(mem);
                self.reg.set_bc(v);
            }
            0x02 => mem.set(self.reg.get_bc(), self.reg.a),
            0x03 => {
                let v = self.reg.get_bc().wrapping_add(1);
                self.reg.set_bc(v);
            }
            0x04 => self.reg.b = self.alu_inc(self.reg.b),
            0x05 => self.reg.b = self.alu_dec(self.reg.b),
            0x06 => self.reg.b = self.imm(mem),
            0x07 => {
                self.reg.a = self.alu_rlc(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            0x08 => {
                let a = self.imm_word(mem);
                mem.set_word(a, self.reg.sp);
            }
            0x09 => self.alu_add_hl(self.reg.get_bc()),
            0x0a => self.reg.a = mem.get(self.reg.get_bc()),
            0x0b => {
                let v = self.reg.get_bc().wrapping_sub(1);
                self.reg.set_bc(v);
            }
            0x0c => self.reg.c = self.alu_inc(self.reg.c),
            0x0d => self.reg.c = self.alu_dec(self.reg.c),
            0x0e => self.reg.c = self.imm(mem),
            0x0f => {
                self.reg.a = self.alu_rrc(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            // STOP carries a padding byte.
            0x10 => self.reg.pc = self.reg.pc.wrapping_add(1),
            0x11 => {
                let v = self.imm_word(mem);
                self.reg.set_de(v);
            }
            0x12 => mem.set(self.reg.get_de(), self.reg.a),
            0x13 => {
                let v = self.reg.get_de().wrapping_add(1);
                self.reg.set_de(v);
            }
            0x14 => self.reg.d = self.alu_inc(self.reg.d),
            0x15 => self.reg.d = self.alu_dec(self.reg.d),
            0x16 => self.reg.d = self.imm(mem),
            0x17 => {
                self.reg.a = self.alu_rl(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            0x18 => self.jump_relative(mem),
            0x19 => self.alu_add_hl(self.reg.get_de()),
            0x1a => self.reg.a = mem.get(self.reg.get_de()),
            0x1b => {
                let v = self.reg.get_de().wrapping_sub(1);
                self.reg.set_de(v);
            }
            0x1c => self.reg.e = self.alu_inc(self.reg.e),
            0x1d => self.reg.e = self.alu_dec(self.reg.e),
            0x1e => self.reg.e = self.imm(mem),
            0x1f => {
                self.reg.a = self.alu_rr(self.reg.a);
                self.reg.set_flag(Z, false);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let cond = match opcode {
                    0x20 => !self.reg.get_flag(Z),
                    0x28 => self.reg.get_flag(Z),
                    0x30 => !self.reg.get_flag(C),
                    _ => self.reg.get_flag(C),
                };
                if cond {
                    self.jump_relative(mem);
                    taken = true;
                } else {
                    self.reg.pc = self.reg.pc.wrapping_add(1);
                }
            }
            0x21 => {
                let v = self.imm_word(mem);
                self.reg.set_hl(v);
            }
            0x22 => {
                let a = self.reg.get_hl();
                mem.set(a, self.reg.a);
                self.reg.set_hl(a.wrapping_add(1));
            }
            0x23 => {
                let v = self.reg.get_hl().wrapping_add(1);
                self.reg.set_hl(v);
            }
            0x24 => self.reg.h = self.alu_inc(self.reg.h),
            0x25 => self.reg.h = self.alu_dec(self.reg.h),
            0x26 => self.reg.h = self.imm(mem),
            0x27 => self.alu_daa(),
            0x29 => self.alu_add_hl(self.reg.get_hl()),
            0x2a => {
                let a = self.reg.get_hl();
                self.reg.a = mem.get(a);
                self.reg.set_hl(a.wrapping_add(1));
            }
            0x2b => {
                let v = self.reg.get_hl().wrapping_sub(1);
                self.reg.set_hl(v);
            }
            0x2c => self.reg.l = self.alu_inc(self.reg.l),
            0x2d => self.reg.l = self.alu_dec(self.reg.l),
            0x2e => self.reg.l = self.imm(mem),
            0x2f => {
                self.reg.a = !self.reg.a;
                self.reg.set_flag(H, true);
                self.reg.set_flag(N, true);
            }
            0x31 => self.reg.sp = self.imm_word(mem),
            0x32 => {
                let a = self.reg.get_hl();
                mem.set(a, self.reg.a);
                self.reg.set_hl(a.wrapping_sub(1));
            }
            0x33 => self.reg.sp = self.reg.sp.wrapping_add(1),
            0x34 => {
                let a = self.reg.get_hl();
                let v = mem.get(a);
                let v = self.alu_inc(v);
                mem.set(a, v);
            }
            0x35 => {
                let a = self.reg.get_hl();
                let v = mem.get(a);
                let v = self.alu_dec(v);
                mem.set(a, v);
            }
            0x36 => {
                let v = self.imm(mem);
                mem.set(self.reg.get_hl(), v);
            }
            0x37 => {
                self.reg.set_flag(C, true);
                self.reg.set_flag(H, false);
                self.reg.set_flag(N, false);
            }
            0x39 => self.alu_add_hl(self.reg.sp),
            0x3a => {
                let a = self.reg.get_hl();
                self.reg.a = mem.get(a);
                self.reg.set_hl(a.wrapping_sub(1));
            }
            0x3b => self.reg.sp = self.reg.sp.wrapping_sub(1),
            0x3c => self.reg.a = self.alu_inc(self.reg.a),
            0x3d => self.reg.a = self.alu_dec(self.reg.a),
            0x3e => self.reg.a = self.imm(mem),
            0x3f => {
                let v = !self.reg.get_flag(C);
                self.reg.set_flag(C, v);
                self.reg.set_flag(H, false);
                self.reg.set_flag(N, false);
            }
            0x76 => {
                let pending = mem.get(0xff0f) & mem.get(0xffff) & 0x1f != 0x00;
                self.halt_mode = if self.ime {
                    HaltMode::Halted
                } else if !pending {
                    HaltMode::HaltedNoIme
                } else {
                    HaltMode::HaltBug
                };
            }
            // LD r,r'
            0x40..=0x7f => {
                let v = self.get_r(mem, opcode & 0x07);
                self.set_r(mem, (opcode >> 3) & 0x07, v);
            }
            // The accumulator ALU block: operation in bits 5-3, operand in bits 2-0.
            0x80..=0xbf => {
                let v = self.get_r(mem, opcode & 0x07);
                match (opcode >> 3) & 0x07 {
                    0 => self.alu_add(v),
                    1 => self.alu_adc(v),
                    2 => self.alu_sub(v),
                    3 => self.alu_sbc(v),
                    4 => self.alu_and(v),
                    5 => self.alu_xor(v),
                    6 => self.alu_or(v),
                    _ => self.alu_cp(v),
                }
            }
            0xc0 | 0xc8 | 0xd0 | 0xd8 => {
                let cond = match opcode {
                    0xc0 => !self.reg.get_flag(Z),
                    0xc8 => self.reg.get_flag(Z),
                    0xd0 => !self.reg.get_flag(C),
                    _ => self.reg.get_flag(C),
                };
                if cond {
                    self.reg.pc = self.stack_pop(mem);
                    taken = true;
                }
            }
            0xc1 => {
                let v = self.stack_pop(mem);
                self.reg.set_bc(v);
            }
            0xc2 | 0xca | 0xd2 | 0xda => {
                let target = self.imm_word(mem);
                let cond = match opcode {
                    0xc2 => !self.reg.get_flag(Z),
                    0xca => self.reg.get_flag(Z),
                    0xd2 => !self.reg.get_flag(C),
                    _ => self.reg.get_flag(C),
                };
                if cond {
                    self.reg.pc = target;
                    taken = true;
                }
            }
            0xc3 => self.reg.pc = self.imm_word(mem),
            0xc4 | 0xcc | 0xd4 | 0xdc => {
                let target = self.imm_word(mem);
                let cond = match opcode {
                    0xc4 => !self.reg.get_flag(Z),
                    0xcc => self.reg.get_flag(Z),
                    0xd4 => !self.reg.get_flag(C),
                    _ => self.reg.get_flag(C),
                };
                if cond {
                    self.stack_push(mem, self.reg.pc);
                    self.reg.pc = target;
                    taken = true;
                }
            }
            0xc5 => self.stack_push(mem, self.reg.get_bc()),
            0xc6 => {
                let v = self.imm(mem);
                self.alu_add(v);
            }
            // RST: the target vector is folded into the opcode.
            0xc7 | 0xcf | 0xd7 | 0xdf | 0xe7 | 0xef | 0xf7 | 0xff => {
                self.stack_push(mem, self.reg.pc);
                self.reg.pc = u16::from(opcode & 0x38);
            }
            0xc9 => self.reg.pc = self.stack_pop(mem),
            0xcb => return self.ex_cb(mem),
            0xcd => {
                let target = self.imm_word(mem);
                self.stack_push(mem, self.reg.pc);
                self.reg.pc = target;
            }
            0xce => {
                let v = self.imm(mem);
                self.alu_adc(v);
            }
            0xd1 => {
                let v = self.stack_pop(mem);
                self.reg.set_de(v);
            }
            0xd5 => self.stack_push(mem, self.reg.get_de()),
            0xd6 => {
                let v = self.imm(mem);
                self.alu_sub(v);
            }
            // RETI enables IME immediately, without the one instruction delay of EI.
            0xd9 => {
                self.reg.pc = self.stack_pop(mem);
                self.ime = true;
            }
            0xde => {
                let v = self.imm(mem);
                self.alu_sbc(v);
            }
            0xe0 => {
                let a = 0xff00 | u16::from(self.imm(mem));
                mem.set(a, self.reg.a);
            }
            0xe1 => {
                let v = self.stack_pop(mem);
                self.reg.set_hl(v);
            }
            0xe2 => mem.set(0xff00 | u16::from(self.reg.c), self.reg.a),
            0xe5 => self.stack_push(mem, self.reg.get_hl()),
            0xe6 => {
                let v = self.imm(mem);
                self.alu_and(v);
            }
            0xe8 => {
                let v = self.alu_add_sp(mem);
                self.reg.sp = v;
            }
            0xe9 => self.reg.pc = self.reg.get_hl(),
            0xea => {
                let a = self.imm_word(mem);
                mem.set(a, self.reg.a);
            }
            0xee => {
                let v = self.imm(mem);
                self.alu_xor(v);
            }
            0xf0 => {
                let a = 0xff00 | u16::from(self.imm(mem));
                self.reg.a = mem.get(a);
            }
            0xf1 => {
                let v = self.stack_pop(mem);
                self.reg.set_af(v);
            }
            0xf2 => self.reg.a = mem.get(0xff00 | u16::from(self.reg.c)),
            0xf3 => self.ime = false,
            0xf5 => self.stack_push(mem, self.reg.get_af()),
            0xf6 => {
                let v = self.imm(mem);
                self.alu_or(v);
            }
            0xf8 => {
                let v = self.alu_add_sp(mem);
                self.reg.set_hl(v);
            }
            0xf9 => self.reg.sp = self.reg.get_hl(),
            0xfa => {
                let a = self.imm_word(mem);
                self.reg.a = mem.get(a);
            }
            0xfb => self.ime = true,
            0xfe => {
                let v = self.imm(mem);
                self.alu_cp(v);
            }
            // These encodings do not exist on the LR35902. Reaching one means the rom is corrupt
            // or the emulator has lost its way, neither of which is recoverable.
            0xd3 | 0xdb | 0xdd | 0xe3 | 0xe4 | 0xeb | 0xec | 0xed | 0xf4 | 0xfc | 0xfd => {
                panic!("Opcode 0x{:02x} is not a valid LR35902 instruction", opcode)
            }
        }
        let extra = if taken {
            match opcode {
                0x20 | 0x28 | 0x30 | 0x38 => 4,
                0xc2 | 0xca | 0xd2 | 0xda => 4,
                0xc0 | 0xc8 | 0xd0 | 0xd8 => 12,
                0xc4 | 0xcc | 0xd4 | 0xdc => 12,
                _ => 0,
            }
        } else {
            0
        };
        OP_CYCLES[usize::from(opcode)] + extra
    }

    // The CB prefixed grid is fully regular: bits 7-6 pick rotate/bit/res/set, bits 5-3 the
    // sub-operation or bit number, bits 2-0 the operand slot.
    fn ex_cb(&mut self, mem: &mut Mmu) -> u32 {
        let code = self.imm(mem);
        let i = code & 0x07;
        let b = (code >> 3) & 0x07;
        match code >> 6 {
            0 => {
                let v = self.get_r(mem, i);
                let r = match b {
                    0 => self.alu_rlc(v),
                    1 => self.alu_rrc(v),
                    2 => self.alu_rl(v),
                    3 => self.alu_rr(v),
                    4 => self.alu_sla(v),
                    5 => self.alu_sra(v),
                    6 => self.alu_swap(v),
                    _ => self.alu_srl(v),
                };
                self.set_r(mem, i, r);
            }
            1 => {
                let v = self.get_r(mem, i);
                self.alu_bit(v, b);
            }
            2 => {
                let v = self.get_r(mem, i) & !(1 << b);
                self.set_r(mem, i, v);
            }
            _ => {
                let v = self.get_r(mem, i) | (1 << b);
                self.set_r(mem, i, v);
            }
        }
        CB_CYCLES[usize::from(code)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    fn make_machine() -> (Cpu, Mmu) {
        let mut rom = vec![0x00; 0x8000];
        rom[0x0147] = 0x00;
        rom[0x0148] = 0x00;
        let mmu = Mmu::power_up(rom).unwrap();
        (Cpu::power_up(), mmu)
    }

    // Loads a program into work ram and points PC at it.
    fn load(cpu: &mut Cpu, mem: &mut Mmu, program: &[u8]) {
        for (i, b) in program.iter().enumerate() {
            mem.set(0xc000 + i as u16, *b);
        }
        cpu.reg.pc = 0xc000;
    }

    #[test]
    fn boot_state_matches_published_values() {
        let (cpu, _) = make_machine();
        assert_eq!(cpu.reg.get_af(), 0x01b0);
        assert_eq!(cpu.reg.get_bc(), 0x0013);
        assert_eq!(cpu.reg.get_de(), 0x00d8);
        assert_eq!(cpu.reg.get_hl(), 0x014d);
        assert_eq!(cpu.reg.sp, 0xfffe);
        assert_eq!(cpu.reg.pc, 0x0100);
        assert_eq!(cpu.cycle_counter, 0);
    }

    #[test]
    fn ld_then_store_to_high_ram_for_all_values() {
        for n in 0..=0xffu8 {
            let (mut cpu, mut mem) = make_machine();
            load(&mut cpu, &mut mem, &[0x3e, n, 0xe0, 0x80]);
            cpu.run_sync(&mut mem, 20);
            assert_eq!(mem.get(0xff80), n);
        }
    }

    #[test]
    fn adc_folds_carry_into_flags() {
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.a = 0xe1;
        cpu.reg.e = 0x0f;
        cpu.reg.set_flag(C, true);
        cpu.reg.set_flag(Z, true);
        load(&mut cpu, &mut mem, &[0x8b]);
        cpu.run_sync(&mut mem, 4);
        assert_eq!(cpu.reg.a, 0xf1);
        assert!(!cpu.reg.get_flag(Z));
        assert!(!cpu.reg.get_flag(N));
        assert!(cpu.reg.get_flag(H));
        assert!(!cpu.reg.get_flag(C));
    }

    #[test]
    fn daa_adjusts_bcd_add_and_sub() {
        // 0x45 + 0x38 = 0x7d, adjusted to 0x83.
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.a = 0x45;
        cpu.reg.b = 0x38;
        load(&mut cpu, &mut mem, &[0x80, 0x27]);
        cpu.run_sync(&mut mem, 8);
        assert_eq!(cpu.reg.a, 0x83);
        assert!(!cpu.reg.get_flag(C));

        // 0x42 - 0x09 = 0x39, adjusted to 0x33.
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.a = 0x42;
        cpu.reg.b = 0x09;
        load(&mut cpu, &mut mem, &[0x90, 0x27]);
        cpu.run_sync(&mut mem, 8);
        assert_eq!(cpu.reg.a, 0x33);
    }

    #[test]
    fn f_low_nibble_stays_zero_across_a_mixed_stream() {
        let (mut cpu, mut mem) = make_machine();
        let program = [
            0x3e, 0x0f, // LD A,0x0f
            0xc6, 0x01, // ADD A,0x01
            0x27, // DAA
            0x17, // RLA
            0xf5, // PUSH AF
            0x3d, // DEC A
            0xf1, // POP AF
            0x2f, // CPL
            0x37, // SCF
            0xde, 0x07, // SBC A,0x07
            0xcb, 0x37, // SWAP A
            0xcb, 0x47, // BIT 0,A
        ];
        load(&mut cpu, &mut mem, &program);
        for _ in 0..22 {
            cpu.run_sync(&mut mem, 4);
            assert_eq!(cpu.reg.f & 0x0f, 0x00);
        }
    }

    #[test]
    fn stack_push_layout() {
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.sp = 0xdff0;
        cpu.reg.set_bc(0x1234);
        load(&mut cpu, &mut mem, &[0xc5, 0xd1]); // PUSH BC; POP DE
        cpu.run_sync(&mut mem, 16);
        assert_eq!(mem.get(0xdfef), 0x12);
        assert_eq!(mem.get(0xdfee), 0x34);
        cpu.run_sync(&mut mem, 12);
        assert_eq!(cpu.reg.get_de(), 0x1234);
        assert_eq!(cpu.reg.sp, 0xdff0);
    }

    #[test]
    fn conditional_branch_timing() {
        // JR NZ not taken costs 8 cycles, taken costs 12.
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.set_flag(Z, true);
        load(&mut cpu, &mut mem, &[0x20, 0x10]);
        cpu.run_sync(&mut mem, 8);
        assert_eq!(cpu.cycle_counter, 8);
        assert_eq!(cpu.reg.pc, 0xc002);

        let (mut cpu, mut mem) = make_machine();
        cpu.reg.set_flag(Z, false);
        load(&mut cpu, &mut mem, &[0x20, 0x10]);
        cpu.run_sync(&mut mem, 12);
        assert_eq!(cpu.cycle_counter, 12);
        assert_eq!(cpu.reg.pc, 0xc012);
    }

    #[test]
    fn call_pushes_the_return_address() {
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.sp = 0xdff0;
        load(&mut cpu, &mut mem, &[0xcd, 0x00, 0xd0]); // CALL 0xd000
        cpu.run_sync(&mut mem, 24);
        assert_eq!(cpu.reg.pc, 0xd000);
        assert_eq!(mem.get_word(0xdfee), 0xc003);
    }

    #[test]
    fn rst_jumps_to_its_vector() {
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.sp = 0xdff0;
        load(&mut cpu, &mut mem, &[0xef]); // RST 28h
        cpu.run_sync(&mut mem, 16);
        assert_eq!(cpu.reg.pc, 0x0028);
        assert_eq!(mem.get_word(0xdfee), 0xc001);
    }

    #[test]
    fn interrupt_dispatch_clears_if_bit_and_jumps() {
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.sp = 0xdff0;
        cpu.ime = true;
        mem.set(0xffff, 0x04);
        mem.set(0xff0f, 0x04);
        load(&mut cpu, &mut mem, &[0x00]);
        cpu.run_sync(&mut mem, 4);
        assert_eq!(cpu.reg.pc, 0x0051); // handler at 0x50 plus the NOP it just ran
        assert!(!cpu.ime);
        assert_eq!(mem.get(0xff0f) & 0x04, 0x00);
        assert_eq!(mem.get_word(0xdfee), 0xc000);
    }

    #[test]
    fn lower_if_bits_win_priority() {
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.sp = 0xdff0;
        cpu.ime = true;
        mem.set(0xffff, 0x1f);
        mem.set(0xff0f, 0x12);
        load(&mut cpu, &mut mem, &[0x00]);
        cpu.run_sync(&mut mem, 4);
        // Bit 1 (LCD STAT, 0x48) dispatches before bit 4 (joypad).
        assert_eq!(cpu.reg.pc, 0x0049);
        assert_eq!(mem.get(0xff0f), 0x10);
    }

    #[test]
    fn halt_with_ime_waits_for_interrupt() {
        let (mut cpu, mut mem) = make_machine();
        cpu.reg.sp = 0xdff0;
        cpu.ime = true;
        mem.set(0xffff, 0x01);
        load(&mut cpu, &mut mem, &[0x76, 0x3c]); // HALT; INC A
        cpu.run_sync(&mut mem, 40);
        assert_eq!(cpu.halt_mode, HaltMode::Halted);
        let halted_at = cpu.cycle_counter;
        assert!(halted_at >= 40);
        // Raise vblank: the dispatcher fires and the cpu resumes.
        mem.set(0xff0f, 0x01);
        cpu.run_sync(&mut mem, 8);
        assert_eq!(cpu.halt_mode, HaltMode::Running);
        assert_eq!(mem.get_word(0xdfee), 0xc001);
        assert!(cpu.reg.pc >= 0x40);
    }

    #[test]
    fn halt_without_ime_wakes_without_dispatch() {
        let (mut cpu, mut mem) = make_machine();
        cpu.ime = false;
        mem.set(0xffff, 0x01);
        load(&mut cpu, &mut mem, &[0x76, 0x3c]); // HALT; INC A
        cpu.run_sync(&mut mem, 12);
        assert_eq!(cpu.halt_mode, HaltMode::HaltedNoIme);
        let a = cpu.reg.a;
        mem.set(0xff0f, 0x01);
        cpu.run_sync(&mut mem, 4);
        // The INC A after the HALT ran exactly once and the request bit is still pending.
        assert_eq!(cpu.reg.a, a.wrapping_add(1));
        assert_eq!(cpu.reg.pc, 0xc002);
        assert_eq!(mem.get(0xff0f) & 0x01, 0x01);
    }

    #[test]
    fn halt_bug_executes_next_opcode_twice() {
        let (mut cpu, mut mem) = make_machine();
        cpu.ime = false;
        cpu.reg.a = 0x00;
        mem.set(0xffff, 0x01);
        mem.set(0xff0f, 0x01);
        load(&mut cpu, &mut mem, &[0x76, 0x3c, 0x00]); // HALT; INC A
        cpu.run_sync(&mut mem, 12);
        assert_eq!(cpu.reg.a, 0x02);
        assert_eq!(cpu.reg.pc, 0xc002);
    }

    #[test]
    fn div_tracks_the_cycle_counter() {
        let (mut cpu, mut mem) = make_machine();
        load(&mut cpu, &mut mem, &[0x00; 0x200]);
        cpu.run_sync(&mut mem, 512);
        assert_eq!(mem.get(0xff04), 0x02);
    }

    #[test]
    fn tima_ticks_at_the_selected_period() {
        let (mut cpu, mut mem) = make_machine();
        mem.set(0xff07, 0x05); // enabled, period 16
        load(&mut cpu, &mut mem, &[0x00; 0x40]);
        cpu.run_sync(&mut mem, 64);
        assert_eq!(mem.get(0xff05), 0x04);
    }

    #[test]
    fn tima_overflow_reloads_tma_and_requests_interrupt() {
        let (mut cpu, mut mem) = make_machine();
        mem.set(0xff07, 0x05);
        mem.set(0xff06, 0xab);
        mem.set(0xff05, 0xff);
        load(&mut cpu, &mut mem, &[0x00; 0x10]);
        cpu.run_sync(&mut mem, 16);
        assert_eq!(mem.get(0xff05), 0xab);
        assert_eq!(mem.get(0xff0f) & 0x04, 0x04);
    }

    #[test]
    fn overshoot_rolls_forward() {
        let (mut cpu, mut mem) = make_machine();
        // CALL takes 24 cycles; a budget of 4 overshoots by 20 which the next call repays.
        cpu.reg.sp = 0xdff0;
        load(&mut cpu, &mut mem, &[0xcd, 0x00, 0xd0]);
        cpu.run_sync(&mut mem, 4);
        assert_eq!(cpu.cycle_counter, 24);
        cpu.run_sync(&mut mem, 20);
        assert_eq!(cpu.cycle_counter, 24);
        cpu.run_sync(&mut mem, 4);
        assert_eq!(cpu.cycle_counter, 28);
    }

    #[test]
    #[should_panic(expected = "not a valid LR35902 instruction")]
    fn unusable_opcode_panics() {
        let (mut cpu, mut mem) = make_machine();
        load(&mut cpu, &mut mem, &[0xd3]);
        cpu.run_sync(&mut mem, 4);
    }
}
