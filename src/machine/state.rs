//! Machine snapshot encode/decode.
//!
//! A snapshot is a JSON document with a `cpu` subtree and a `memory` section.
//! Rom content is identified by md5 digest (recomputed from controller reads,
//! never stored); ram is the ascending complement of the rom ranges,
//! compressed and base64-encoded. See the crate docs for the exact shape and
//! the accepted `bytes` uri schemes.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::controller::Controller;
use crate::cpu::Intel8080;
use crate::error::Error;
use crate::transcode;

/// Highest address covered by rom/ram bookkeeping.
const ADDRESS_SPACE_END: u32 = 0xFFFF;

/// Capture the machine state as the snapshot JSON document.
///
/// Requires the base64 encoder and a memory controller with an identity.
pub(super) fn save_state(
    cpu: &Intel8080,
    memory: &mut dyn Controller,
    rom_ranges: &BTreeMap<u16, u16>,
    encoder: &str,
    compressor: &str,
) -> Result<String, Error> {
    if encoder != "base64" {
        return Err(Error::JsonConfig(
            "machine state requires the base64 encoder".into(),
        ));
    }

    let mem_uuid = memory.uuid();

    if mem_uuid.is_nil() {
        return Err(Error::IncompatibleUuid);
    }

    let ram_ranges = derive_ram_ranges(rom_ranges);
    let rom = read_ranges(memory, rom_ranges);
    let ram = read_ranges(memory, &ram_ranges);
    let rom_md5 = transcode::md5_digest(&rom);

    let ram_payload = transcode::bin_to_txt(encoder, compressor, &ram)?;
    let ram_uri = if compressor == "none" {
        format!("base64://{ram_payload}")
    } else {
        format!("base64://{compressor}://{ram_payload}")
    };

    Ok(format!(
        r#"{{"cpu":{},"memory":{{"uuid":"base64://{}","rom":{{"bytes":"base64://md5://{}"}},"ram":{{"size":{},"bytes":"{}"}}}}}}"#,
        cpu.save()?,
        transcode::bin_to_txt("base64", "none", mem_uuid.as_bytes())?,
        transcode::bin_to_txt("base64", "none", &rom_md5)?,
        ram.len(),
        ram_uri,
    ))
}

/// Restore a snapshot: verify identities, write rom blocks, fill the derived
/// ram ranges and finally load the cpu subtree.
///
/// The cpu uuid is only enforced when the snapshot restores ram; a rom-only
/// load tolerates a different cpu.
pub(super) fn load_state(
    json_text: &str,
    cpu: &mut Intel8080,
    memory: &mut dyn Controller,
    io: &mut dyn Controller,
    rom_ranges: &mut BTreeMap<u16, u16>,
) -> Result<(), Error> {
    let mem_uuid = memory.uuid();

    if mem_uuid.is_nil() {
        return Err(Error::IncompatibleUuid);
    }

    let json: Value =
        serde_json::from_str(json_text).map_err(|e| Error::JsonParse(e.to_string()))?;
    let mem = json
        .get("memory")
        .ok_or_else(|| Error::JsonParse("missing memory section".into()))?;
    let rom = mem
        .get("rom")
        .ok_or_else(|| Error::JsonParse("missing memory.rom".into()))?;
    let ram = mem.get("ram");

    // Restoring ram only makes sense against the same memory controller.
    if ram.is_some() && mem.get("uuid").is_none() {
        return Err(Error::JsonParse("memory.ram requires memory.uuid".into()));
    }

    if let Some(uuid) = mem.get("uuid") {
        let uuid = uuid
            .as_str()
            .ok_or_else(|| Error::JsonConfig("memory.uuid must be a string".into()))?;
        let b64 = uuid
            .strip_prefix("base64://")
            .ok_or_else(|| Error::UriScheme(uuid.into()))?;
        let bytes =
            transcode::txt_to_bin("base64", "none", b64).map_err(|_| Error::IncompatibleUuid)?;

        if bytes != mem_uuid.as_bytes() {
            return Err(Error::IncompatibleUuid);
        }
    }

    let mut cleared = false;

    if let Some(blocks) = rom.get("block") {
        let blocks = blocks
            .as_array()
            .ok_or_else(|| Error::JsonConfig("memory.rom.block must be an array".into()))?;

        for block in blocks {
            load_rom_block(block, memory, io, rom_ranges, &mut cleared)?;
        }
    } else {
        load_rom_block(rom, memory, io, rom_ranges, &mut cleared)?;
    }

    let ram_ranges = derive_ram_ranges(rom_ranges);

    match ram {
        Some(ram) => {
            let uri = ram
                .get("bytes")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::JsonParse("missing memory.ram.bytes".into()))?;
            let rest = uri
                .strip_prefix("base64://")
                .ok_or_else(|| Error::UriScheme(uri.into()))?;
            let (compressor, payload) = match rest.strip_prefix("zlib://") {
                Some(payload) => ("zlib", payload),
                None => ("none", rest),
            };

            let bytes = transcode::txt_to_bin("base64", compressor, payload)
                .map_err(|_| Error::IncompatibleRam)?;
            let total: u32 = ram_ranges.values().map(|&size| size as u32).sum();

            if bytes.len() as u32 != total {
                return Err(Error::IncompatibleRam);
            }

            let mut src = bytes.iter();

            for (&offset, &size) in &ram_ranges {
                for addr in offset as u32..offset as u32 + size as u32 {
                    if let Some(&byte) = src.next() {
                        memory.write(addr as u16, byte, Some(io));
                    }
                }
            }
        }
        None => {
            // No ram in the snapshot: the ranges start out clear.
            for (&offset, &size) in &ram_ranges {
                for addr in offset as u32..offset as u32 + size as u32 {
                    memory.write(addr as u16, 0x00, Some(io));
                }
            }
        }
    }

    if let Some(cpu_state) = json.get("cpu") {
        cpu.load(cpu_state, ram.is_some())?;
    }

    Ok(())
}

/// Write one rom block into memory according to its `bytes` uri scheme, and
/// record its range. The first range-declaring block of a load clears the
/// previous rom table; `md5://` identity blocks neither clear nor declare.
fn load_rom_block(
    block: &Value,
    memory: &mut dyn Controller,
    io: &mut dyn Controller,
    rom_ranges: &mut BTreeMap<u16, u16>,
    cleared: &mut bool,
) -> Result<(), Error> {
    let uri = block
        .get("bytes")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::JsonConfig("rom block missing bytes".into()))?;
    let offset = address_field(block, "offset")?;
    let size = address_field(block, "size")?;

    let mut declare = |rom_ranges: &mut BTreeMap<u16, u16>, offset: u32, size: u32| {
        if !*cleared {
            rom_ranges.clear();
            *cleared = true;
        }

        rom_ranges.insert(offset as u16, size as u16);
    };

    if let Some(path) = uri.strip_prefix("file://") {
        let data = std::fs::read(path).map_err(|_| Error::IncompatibleRom)?;
        let size = if size == 0 { data.len() as u32 } else { size };

        if offset + size > ADDRESS_SPACE_END {
            return Err(Error::JsonConfig("rom block exceeds the address space".into()));
        }

        for (i, &byte) in data.iter().take(size as usize).enumerate() {
            memory.write((offset + i as u32) as u16, byte, Some(io));
        }

        declare(rom_ranges, offset, size);
    } else if let Some(rest) = uri.strip_prefix("base64://") {
        if let Some(digest) = rest.strip_prefix("md5://") {
            // Identity check only: the rom already attached must hash to the
            // recorded digest over the declared ranges.
            let recorded = transcode::txt_to_bin("base64", "none", digest)
                .map_err(|_| Error::IncompatibleRom)?;
            let mut rom = Vec::new();

            for (&start, &len) in rom_ranges.iter() {
                for addr in start as u32..start as u32 + len as u32 {
                    rom.push(memory.read(addr as u16, Some(io)));
                }
            }

            if recorded != transcode::md5_digest(&rom) {
                return Err(Error::IncompatibleRom);
            }
        } else if let Some(payload) = rest.strip_prefix("zlib://") {
            if size == 0 || offset + size > ADDRESS_SPACE_END {
                return Err(Error::JsonConfig("bad compressed rom block bounds".into()));
            }

            let data = transcode::txt_to_bin("base64", "zlib", payload)
                .map_err(|_| Error::IncompatibleRom)?;

            for (i, &byte) in data.iter().enumerate() {
                memory.write((offset + i as u32) as u16, byte, Some(io));
            }

            declare(rom_ranges, offset, size);
        } else {
            let data =
                transcode::txt_to_bin("base64", "none", rest).map_err(|_| Error::IncompatibleRom)?;
            let size = if size == 0 { data.len() as u32 } else { size };

            if offset + size > ADDRESS_SPACE_END || size as usize > data.len() {
                return Err(Error::JsonConfig("bad rom block bounds".into()));
            }

            for (i, &byte) in data.iter().take(size as usize).enumerate() {
                memory.write((offset + i as u32) as u16, byte, Some(io));
            }

            declare(rom_ranges, offset, size);
        }
    } else {
        let scheme = uri.split("://").next().unwrap_or(uri);
        return Err(Error::UriScheme(scheme.into()));
    }

    Ok(())
}

/// The ascending complement of the rom ranges over the address space.
pub(super) fn derive_ram_ranges(rom_ranges: &BTreeMap<u16, u16>) -> BTreeMap<u16, u16> {
    let mut ram = BTreeMap::new();
    let mut offset: u32 = 0;

    for (&start, &size) in rom_ranges {
        if offset < start as u32 {
            ram.insert(offset as u16, (start as u32 - offset) as u16);
        }

        offset = start as u32 + size as u32;
    }

    if offset < ADDRESS_SPACE_END {
        ram.insert(offset as u16, (ADDRESS_SPACE_END - offset) as u16);
    }

    ram
}

fn read_ranges(memory: &mut dyn Controller, ranges: &BTreeMap<u16, u16>) -> Vec<u8> {
    let mut bytes = Vec::new();

    for (&offset, &size) in ranges {
        for addr in offset as u32..offset as u32 + size as u32 {
            bytes.push(memory.read(addr as u16, None));
        }
    }

    bytes
}

/// A non-negative 16-bit address/size field; absent means zero.
fn address_field(block: &Value, key: &str) -> Result<u32, Error> {
    match block.get(key) {
        None => Ok(0),
        Some(v) => v
            .as_u64()
            .filter(|n| *n <= ADDRESS_SPACE_END as u64)
            .map(|n| n as u32)
            .ok_or_else(|| Error::JsonConfig(format!("bad rom block {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::controller::Isr;

    struct RamController {
        bytes: Vec<u8>,
        uuid: Uuid,
    }

    impl RamController {
        fn new() -> Self {
            RamController {
                bytes: vec![0; 0x10000],
                uuid: Uuid::from_bytes([0xAA; 16]),
            }
        }
    }

    impl Controller for RamController {
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
            self.uuid
        }
    }

    struct NullIo;

    impl Controller for NullIo {
        fn read(&mut self, _address: u16, _sibling: Option<&mut dyn Controller>) -> u8 {
            0
        }

        fn write(&mut self, _address: u16, _value: u8, _sibling: Option<&mut dyn Controller>) {}

        fn service_interrupts(
            &mut self,
            _curr_time_ns: u64,
            _total_cycles: u64,
            _sibling: Option<&mut dyn Controller>,
        ) -> Isr {
            Isr::NoInterrupt
        }

        fn uuid(&self) -> Uuid {
            Uuid::nil()
        }
    }

    #[test]
    fn ram_ranges_complement_rom() {
        let mut rom = BTreeMap::new();
        assert_eq!(
            derive_ram_ranges(&rom),
            BTreeMap::from([(0u16, 0xFFFFu16)])
        );

        rom.insert(0x0000, 0x0100);
        rom.insert(0x0200, 0x0100);
        assert_eq!(
            derive_ram_ranges(&rom),
            BTreeMap::from([(0x0100u16, 0x0100u16), (0x0300, 0xFCFF)])
        );
    }

    #[test]
    fn rom_block_load_writes_memory_and_declares_ranges() {
        let mut memory = RamController::new();
        let mut io = NullIo;
        let mut cpu = Intel8080::new();
        let mut rom_ranges = BTreeMap::from([(0x1000u16, 0x0004u16)]);

        // D3 FE D3 FF 76 at 0, program counter at 0x0100.
        let snapshot = r#"{"cpu":{"pc":256},"memory":{"rom":{"bytes":"base64://0/7T/3Y=","offset":0}}}"#;
        load_state(snapshot, &mut cpu, &mut memory, &mut io, &mut rom_ranges).unwrap();

        assert_eq!(&memory.bytes[..5], &[0xD3, 0xFE, 0xD3, 0xFF, 0x76]);
        assert_eq!(cpu.pc, 256);
        // The stale range table was replaced by this load's declaration.
        assert_eq!(rom_ranges, BTreeMap::from([(0u16, 5u16)]));
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut memory = RamController::new();
        let mut io = NullIo;
        let mut cpu = Intel8080::new();
        let mut rom_ranges = BTreeMap::new();

        let rom = r#"{"memory":{"rom":{"bytes":"base64://0/7T/3Y=","offset":0}}}"#;
        load_state(rom, &mut cpu, &mut memory, &mut io, &mut rom_ranges).unwrap();

        cpu.pc = 0x0002;
        cpu.a = 0x42;
        memory.bytes[0x2000] = 0x77;

        let snapshot = save_state(&cpu, &mut memory, &rom_ranges, "base64", "zlib").unwrap();

        // Corrupt the live state, then restore.
        let mut restored_cpu = Intel8080::new();
        memory.bytes[0x2000] = 0;
        memory.bytes[0x0000] = 0;
        let err = load_state(
            &snapshot,
            &mut restored_cpu,
            &mut memory,
            &mut io,
            &mut rom_ranges,
        );
        // Rom content changed: the md5 identity check must refuse.
        assert_eq!(err, Err(Error::IncompatibleRom));

        memory.bytes[0x0000] = 0xD3;
        load_state(
            &snapshot,
            &mut restored_cpu,
            &mut memory,
            &mut io,
            &mut rom_ranges,
        )
        .unwrap();

        assert_eq!(restored_cpu.pc, 0x0002);
        assert_eq!(restored_cpu.a, 0x42);
        assert_eq!(memory.bytes[0x2000], 0x77);
    }

    #[test]
    fn save_requires_base64_and_identity() {
        let mut memory = RamController::new();
        let cpu = Intel8080::new();
        let ranges = BTreeMap::new();

        assert!(matches!(
            save_state(&cpu, &mut memory, &ranges, "none", "zlib"),
            Err(Error::JsonConfig(_))
        ));

        memory.uuid = Uuid::nil();
        assert_eq!(
            save_state(&cpu, &mut memory, &ranges, "base64", "zlib"),
            Err(Error::IncompatibleUuid)
        );
    }

    #[test]
    fn foreign_memory_uuid_is_refused() {
        let mut memory = RamController::new();
        let mut io = NullIo;
        let mut cpu = Intel8080::new();
        let mut rom_ranges = BTreeMap::new();

        let snapshot = format!(
            r#"{{"memory":{{"uuid":"base64://{}","rom":{{"bytes":"base64://AA=="}}}}}}"#,
            transcode::bin_to_txt("base64", "none", &[0xBB; 16]).unwrap()
        );
        assert_eq!(
            load_state(&snapshot, &mut cpu, &mut memory, &mut io, &mut rom_ranges),
            Err(Error::IncompatibleUuid)
        );
    }

    #[test]
    fn ram_length_mismatch_is_refused() {
        let mut memory = RamController::new();
        let mut io = NullIo;
        let mut cpu = Intel8080::new();
        let mut rom_ranges = BTreeMap::new();

        let uuid = transcode::bin_to_txt("base64", "none", &[0xAA; 16]).unwrap();
        let short_ram = transcode::bin_to_txt("base64", "zlib", &[0x11; 16]).unwrap();
        let snapshot = format!(
            r#"{{"memory":{{"uuid":"base64://{uuid}","rom":{{"bytes":"base64://AA=="}},"ram":{{"size":16,"bytes":"base64://zlib://{short_ram}"}}}}}}"#,
        );

        assert_eq!(
            load_state(&snapshot, &mut cpu, &mut memory, &mut io, &mut rom_ranges),
            Err(Error::IncompatibleRam)
        );
    }

    #[test]
    fn unknown_uri_scheme_is_refused() {
        let mut memory = RamController::new();
        let mut io = NullIo;
        let mut cpu = Intel8080::new();
        let mut rom_ranges = BTreeMap::new();

        let snapshot = r#"{"memory":{"rom":{"bytes":"ftp://rom.bin"}}}"#;
        assert_eq!(
            load_state(snapshot, &mut cpu, &mut memory, &mut io, &mut rom_ranges),
            Err(Error::UriScheme("ftp".into()))
        );
    }

    #[test]
    fn file_scheme_reads_from_disk() {
        let path = std::env::temp_dir().join("meen_state_test.rom");
        std::fs::write(&path, [0x3E, 0x01, 0x76]).unwrap();

        let mut memory = RamController::new();
        let mut io = NullIo;
        let mut cpu = Intel8080::new();
        let mut rom_ranges = BTreeMap::new();

        let snapshot = format!(
            r#"{{"memory":{{"rom":{{"bytes":"file://{}","offset":256}}}}}}"#,
            path.display()
        );
        load_state(&snapshot, &mut cpu, &mut memory, &mut io, &mut rom_ranges).unwrap();

        assert_eq!(&memory.bytes[256..259], &[0x3E, 0x01, 0x76]);
        assert_eq!(rom_ranges, BTreeMap::from([(256u16, 3u16)]));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_rom_section_is_a_parse_error() {
        let mut memory = RamController::new();
        let mut io = NullIo;
        let mut cpu = Intel8080::new();
        let mut rom_ranges = BTreeMap::new();

        assert!(matches!(
            load_state(
                r#"{"memory":{}}"#,
                &mut cpu,
                &mut memory,
                &mut io,
                &mut rom_ranges
            ),
            Err(Error::JsonParse(_))
        ));
        assert!(matches!(
            load_state(r#"{}"#, &mut cpu, &mut memory, &mut io, &mut rom_ranges),
            Err(Error::JsonParse(_))
        ));
    }
}
