//! Reusable controllers for driving a machine under test.
//!
//! Port conventions (written by the programs under test):
//!   0xFF quit, 0xFE save, 0xFD load.
//! Tests arm the initial program load by writing 0xFD before attaching.

use std::sync::{Arc, Mutex};

use meen::{Controller, Isr, Uuid};

/// A flat 64K ram with a stable identity.
pub struct MemoryController {
    pub bytes: Vec<u8>,
}

impl MemoryController {
    pub fn new() -> Self {
        MemoryController {
            bytes: vec![0; 0x10000],
        }
    }
}

impl Controller for MemoryController {
    fn read(&mut self, address: u16, _sibling: Option<&mut dyn Controller>) -> u8 {
        self.bytes[address as usize]
    }

    fn write(&mut self, address: u16, value: u8, _sibling: Option<&mut dyn Controller>) {
        self.bytes[address as usize] = value;
    }

    fn service_interrupts(
        &mut self,
        _curr_time_ns: u64,
        _total_cycles: u64,
        _sibling: Option<&mut dyn Controller>,
    ) -> Isr {
        Isr::NoInterrupt
    }

    fn uuid(&self) -> Uuid {
        Uuid::from_bytes([
            0xCE, 0xE1, 0x24, 0x89, 0x10, 0x2F, 0x4F, 0x33, 0xB9, 0x54, 0x3E, 0xBF, 0x1C, 0x0B,
            0x54, 0xB9,
        ])
    }
}

/// An i/o controller with the quit/save/load port mapping, one data device
/// and a once-per-emulated-second RST 1 source.
pub struct TestIoController {
    device_data: u8,
    power_off: bool,
    save: bool,
    load: bool,
    /// Fire a quit once the machine reaches this cycle count.
    quit_cycle: Option<u64>,
    last_time: u64,
}

impl TestIoController {
    pub fn new() -> Self {
        TestIoController {
            device_data: 0,
            power_off: false,
            save: false,
            load: false,
            quit_cycle: None,
            last_time: 0,
        }
    }

    pub fn quit_on_cycle(mut self, cycle: u64) -> Self {
        self.quit_cycle = Some(cycle);
        self
    }
}

impl Controller for TestIoController {
    fn read(&mut self, address: u16, _sibling: Option<&mut dyn Controller>) -> u8 {
        match address {
            0x00 => self.device_data,
            _ => 0,
        }
    }

    fn write(&mut self, address: u16, value: u8, _sibling: Option<&mut dyn Controller>) {
        match address {
            0x00 => self.device_data = value,
            0xFF => self.power_off = true,
            0xFE => self.save = true,
            0xFD => self.load = true,
            _ => {}
        }
    }

    fn service_interrupts(
        &mut self,
        curr_time_ns: u64,
        total_cycles: u64,
        _sibling: Option<&mut dyn Controller>,
    ) -> Isr {
        if self.power_off {
            self.power_off = false;
            return Isr::Quit;
        }

        if self.save {
            self.save = false;
            return Isr::Save;
        }

        if self.load {
            self.load = false;
            return Isr::Load;
        }

        if self.quit_cycle.is_some_and(|cycle| total_cycles >= cycle) {
            self.quit_cycle = None;
            return Isr::Quit;
        }

        // Fire rst 1 once per emulated second; programs that never enable
        // interrupts simply drop it.
        if curr_time_ns < self.last_time {
            self.last_time = curr_time_ns;
        } else if curr_time_ns - self.last_time > 1_000_000_000 {
            self.last_time = curr_time_ns;
            return Isr::One;
        }

        Isr::NoInterrupt
    }

    fn uuid(&self) -> Uuid {
        Uuid::from_bytes([
            0xD8, 0x62, 0xFA, 0xBD, 0xDE, 0xDD, 0x47, 0xB7, 0x8C, 0x38, 0xD0, 0xDE, 0xB5, 0xCC,
            0x45, 0xBE,
        ])
    }
}

/// A CP/M-flavoured console: the BDOS shim in program memory forwards print
/// calls to ports 0..2, and mode 9 reads the `$`-terminated message straight
/// from program memory through the sibling controller hint.
pub struct CpmIoController {
    print_mode: u8,
    addr_hi: u8,
    output: Arc<Mutex<Vec<u8>>>,
    power_off: bool,
    save: bool,
    load: bool,
}

impl CpmIoController {
    pub fn new() -> Self {
        CpmIoController {
            print_mode: 0,
            addr_hi: 0,
            output: Arc::new(Mutex::new(Vec::new())),
            power_off: false,
            save: false,
            load: false,
        }
    }

    /// Shared view of the console output, readable while the controller is
    /// attached to a running machine.
    pub fn output(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.output)
    }
}

impl Controller for CpmIoController {
    fn read(&mut self, _address: u16, _sibling: Option<&mut dyn Controller>) -> u8 {
        0
    }

    fn write(&mut self, address: u16, value: u8, sibling: Option<&mut dyn Controller>) {
        match address {
            0 => self.print_mode = value,
            1 => self.addr_hi = value,
            2 => match self.print_mode {
                9 => {
                    let memory = match sibling {
                        Some(memory) => memory,
                        None => return,
                    };
                    let mut addr = (self.addr_hi as u16) << 8 | value as u16;
                    let mut output = self.output.lock().unwrap();

                    loop {
                        let ch = memory.read(addr, None);

                        if ch == b'$' {
                            break;
                        }

                        output.push(ch);
                        addr = addr.wrapping_add(1);
                    }
                }
                2 => self.output.lock().unwrap().push(value),
                _ => {}
            },
            0xFF => self.power_off = true,
            0xFE => self.save = true,
            0xFD => self.load = true,
            _ => {}
        }
    }

    fn service_interrupts(
        &mut self,
        _curr_time_ns: u64,
        _total_cycles: u64,
        _sibling: Option<&mut dyn Controller>,
    ) -> Isr {
        if self.power_off {
            self.power_off = false;
            return Isr::Quit;
        }

        if self.save {
            self.save = false;
            return Isr::Save;
        }

        if self.load {
            self.load = false;
            return Isr::Load;
        }

        Isr::NoInterrupt
    }

    fn uuid(&self) -> Uuid {
        Uuid::from_bytes([
            0x32, 0x8C, 0xCF, 0x78, 0x76, 0x1B, 0x48, 0xA4, 0x98, 0x2C, 0x1A, 0xAA, 0x5F, 0x14,
            0x31, 0x24,
        ])
    }
}
