use std::error::Error as StdError;
use std::fmt;

use byteorder::ByteOrder;
use util::Endian;

use crate::config::Config;
use crate::constants::{HEAP_TOP, STACK_TOP, TEXT_START, WORD_BYTES};
use crate::executable::Executable;
use crate::fault::{Fault, FaultKind};
use crate::layout::MemoryLayout;
use crate::libc;

/// The requested layout does not fit the configured guest memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotEnoughMemory {
    pub required: u64,
    pub available: u64,
}

impl fmt::Display for NotEnoughMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "not enough memory for the program: {} bytes required, {} available\n\
             (the lowest {:#x} bytes are reserved, sections are aligned to 4096 bytes,\n\
             and the libc stub table precedes user text)",
            self.required, self.available, TEXT_START
        )
    }
}

impl StdError for NotEnoughMemory {}

/// The guest address space.
///
/// Statically laid out sections live in one flat buffer starting at
/// [`TEXT_START`]; the heap grows from the end of bss up to [`HEAP_TOP`]
/// (or to the bottom of the stack, whichever is lower); the stack occupies
/// the top of the address space. Alongside the text bytes sits the decode
/// cache: one [`Executable`] slot per text word, libc stubs pre-filled,
/// everything else on the self-rewriting decode handler.
pub struct Memory {
    static_area: Vec<u8>,
    text_end: u32,
    data_start: u32,
    data_end: u32,
    rodata_start: u32,
    rodata_end: u32,
    bss_start: u32,
    static_end: u32,
    heap: Vec<u8>,
    heap_start: u32,
    heap_top: u32,
    brk: u32,
    stack: Vec<u8>,
    stack_bottom: u32,
    storage_size: u64,
    executables: Vec<Executable>,
}

impl Memory {
    pub fn create(config: &Config, layout: &MemoryLayout) -> Result<Memory, NotEnoughMemory> {
        let static_end = layout.end();
        let stack_size = config.stack_size;
        let stack_bottom = STACK_TOP - stack_size;
        let heap_top = HEAP_TOP.min(stack_bottom);

        let static_size = (static_end - TEXT_START) as u64;
        let required = static_size + stack_size as u64;
        if static_end > heap_top || required > config.storage_size {
            return Err(NotEnoughMemory {
                required,
                available: config.storage_size.min(heap_top as u64 - TEXT_START as u64),
            });
        }

        let mut static_area = vec![0u8; static_size as usize];
        for segment in [&layout.text, &layout.data, &layout.rodata].iter() {
            let offset = (segment.start - TEXT_START) as usize;
            static_area[offset..offset + segment.data.len()].copy_from_slice(&segment.data);
        }

        let slots = (layout.text.data.len() as u32 + WORD_BYTES - 1) / WORD_BYTES;
        let mut executables = vec![Executable::decode_slot(); slots as usize];
        for index in 0..libc::NAMES.len().min(executables.len()) {
            executables[index] = Executable::libc_slot(index);
        }

        Ok(Memory {
            static_area,
            text_end: layout.text.end(),
            data_start: layout.data.start,
            data_end: layout.data.end(),
            rodata_start: layout.rodata.start,
            rodata_end: layout.rodata.end(),
            bss_start: layout.bss_start,
            static_end,
            heap: Vec::new(),
            heap_start: static_end,
            heap_top,
            brk: static_end,
            stack: vec![0u8; stack_size as usize],
            stack_bottom,
            storage_size: config.storage_size,
            executables,
        })
    }

    /// Current heap frontier, for tests and diagnostics.
    pub fn brk(&self) -> u32 {
        self.brk
    }

    fn load_slice(&self, addr: u32, size: u32) -> Result<&[u8], Fault> {
        if addr % size != 0 {
            return Err(Fault::misaligned(FaultKind::LoadMisAligned, addr, size));
        }
        let end = addr as u64 + size as u64;
        if addr >= TEXT_START && end <= self.static_end as u64 {
            let offset = (addr - TEXT_START) as usize;
            Ok(&self.static_area[offset..offset + size as usize])
        } else if addr >= self.heap_start && end <= self.brk as u64 {
            let offset = (addr - self.heap_start) as usize;
            Ok(&self.heap[offset..offset + size as usize])
        } else if addr >= self.stack_bottom && end <= STACK_TOP as u64 {
            let offset = (addr - self.stack_bottom) as usize;
            Ok(&self.stack[offset..offset + size as usize])
        } else {
            Err(Fault::out_of_bound(FaultKind::LoadOutOfBound, addr, size))
        }
    }

    fn store_slice(&mut self, addr: u32, size: u32) -> Result<&mut [u8], Fault> {
        if addr % size != 0 {
            return Err(Fault::misaligned(FaultKind::StoreMisAligned, addr, size));
        }
        let end = addr as u64 + size as u64;
        let size = size as usize;
        if addr >= self.data_start && end <= self.data_end as u64 {
            let offset = (addr - TEXT_START) as usize;
            Ok(&mut self.static_area[offset..offset + size])
        } else if addr >= self.bss_start && end <= self.static_end as u64 {
            let offset = (addr - TEXT_START) as usize;
            Ok(&mut self.static_area[offset..offset + size])
        } else if addr >= self.heap_start && end <= self.brk as u64 {
            let offset = (addr - self.heap_start) as usize;
            Ok(&mut self.heap[offset..offset + size])
        } else if addr >= self.stack_bottom && end <= STACK_TOP as u64 {
            let offset = (addr - self.stack_bottom) as usize;
            Ok(&mut self.stack[offset..offset + size])
        } else {
            Err(Fault::out_of_bound(
                FaultKind::StoreOutOfBound,
                addr,
                size as u32,
            ))
        }
    }

    pub fn load_i8(&self, addr: u32) -> Result<i8, Fault> {
        Ok(self.load_slice(addr, 1)?[0] as i8)
    }

    pub fn load_u8(&self, addr: u32) -> Result<u8, Fault> {
        Ok(self.load_slice(addr, 1)?[0])
    }

    pub fn load_i16(&self, addr: u32) -> Result<i16, Fault> {
        Ok(Endian::read_i16(self.load_slice(addr, 2)?))
    }

    pub fn load_u16(&self, addr: u32) -> Result<u16, Fault> {
        Ok(Endian::read_u16(self.load_slice(addr, 2)?))
    }

    pub fn load_i32(&self, addr: u32) -> Result<i32, Fault> {
        Ok(Endian::read_i32(self.load_slice(addr, 4)?))
    }

    pub fn load_u32(&self, addr: u32) -> Result<u32, Fault> {
        Ok(Endian::read_u32(self.load_slice(addr, 4)?))
    }

    pub fn store_u8(&mut self, addr: u32, value: u8) -> Result<(), Fault> {
        self.store_slice(addr, 1)?[0] = value;
        Ok(())
    }

    pub fn store_u16(&mut self, addr: u32, value: u16) -> Result<(), Fault> {
        Endian::write_u16(self.store_slice(addr, 2)?, value);
        Ok(())
    }

    pub fn store_u32(&mut self, addr: u32, value: u32) -> Result<(), Fault> {
        Endian::write_u32(self.store_slice(addr, 4)?, value);
        Ok(())
    }

    /// Instruction fetch: a 4-byte read restricted to the text segment.
    pub fn load_cmd(&self, pc: u32) -> Result<u32, Fault> {
        if pc % WORD_BYTES != 0 {
            return Err(Fault::misaligned(FaultKind::InsMisAligned, pc, WORD_BYTES));
        }
        if pc < TEXT_START || pc as u64 + WORD_BYTES as u64 > self.text_end as u64 {
            return Err(Fault::out_of_bound(FaultKind::InsOutOfBound, pc, WORD_BYTES));
        }
        let offset = (pc - TEXT_START) as usize;
        Ok(Endian::read_u32(&self.static_area[offset..offset + 4]))
    }

    /// Returns the decode-cache slot for `pc`. The slot starts out as the
    /// generic decode handler and is rewritten once on first execution.
    pub fn fetch_executable(&self, pc: u32) -> Result<Executable, Fault> {
        if pc % WORD_BYTES != 0 {
            return Err(Fault::misaligned(FaultKind::InsMisAligned, pc, WORD_BYTES));
        }
        if pc < TEXT_START || pc as u64 + WORD_BYTES as u64 > self.text_end as u64 {
            return Err(Fault::out_of_bound(FaultKind::InsOutOfBound, pc, WORD_BYTES));
        }
        Ok(self.executables[((pc - TEXT_START) / WORD_BYTES) as usize])
    }

    /// Replaces the slot for `pc` with its decoded form. `pc` must have
    /// passed [`fetch_executable`](Self::fetch_executable) already.
    pub fn set_executable(&mut self, pc: u32, exe: Executable) {
        self.executables[((pc - TEXT_START) / WORD_BYTES) as usize] = exe;
    }

    /// Moves the heap frontier by `delta` bytes and returns the old
    /// frontier, or `None` if the heap would leave its segment or exceed
    /// the storage budget.
    pub fn sbrk(&mut self, delta: i32) -> Option<u32> {
        let old = self.brk;
        let new = old as i64 + delta as i64;
        if new < self.heap_start as i64 || new > self.heap_top as i64 {
            return None;
        }
        let new = new as u32;
        if new > old {
            let allocated =
                self.static_area.len() as u64 + self.stack.len() as u64 + (new - self.heap_start) as u64;
            if allocated > self.storage_size {
                return None;
            }
            self.heap.resize((new - self.heap_start) as usize, 0);
        }
        self.brk = new;
        Some(old)
    }

    /// The byte span from `addr` to the end of its segment, for the
    /// string-like arguments of libc stubs. Empty for invalid addresses;
    /// never faults.
    pub fn libc_access(&self, addr: u32) -> &[u8] {
        if addr >= TEXT_START && addr < self.static_end {
            &self.static_area[(addr - TEXT_START) as usize..]
        } else if addr >= self.heap_start && addr < self.brk {
            &self.heap[(addr - self.heap_start) as usize..]
        } else if addr >= self.stack_bottom && addr < STACK_TOP {
            &self.stack[(addr - self.stack_bottom) as usize..]
        } else {
            &[]
        }
    }

    /// Mutable variant of [`libc_access`](Self::libc_access). Text and
    /// rodata are excluded; a correct guest never passes such pointers to
    /// libc output parameters.
    pub fn libc_access_mut(&mut self, addr: u32) -> &mut [u8] {
        if addr >= self.data_start && addr < self.rodata_start && addr < self.static_end {
            &mut self.static_area[(addr - TEXT_START) as usize..(self.rodata_start - TEXT_START) as usize]
        } else if addr >= self.bss_start && addr < self.static_end {
            &mut self.static_area[(addr - TEXT_START) as usize..]
        } else if addr >= self.heap_start && addr < self.brk {
            &mut self.heap[(addr - self.heap_start) as usize..]
        } else if addr >= self.stack_bottom && addr < STACK_TOP {
            &mut self.stack[(addr - self.stack_bottom) as usize..]
        } else {
            &mut []
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::Segment;

    fn test_layout() -> MemoryLayout {
        let text_data = vec![0u8; 0x100];
        let data_start = 0x11000;
        let rodata_start = 0x12000;
        let bss_start = 0x13000;
        MemoryLayout {
            text: Segment {
                start: TEXT_START,
                data: text_data,
            },
            data: Segment {
                start: data_start,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            },
            rodata: Segment {
                start: rodata_start,
                data: b"hi\n\0".to_vec(),
            },
            bss_start,
            bss_size: 0x40,
            position_table: Default::default(),
        }
    }

    fn test_memory() -> Memory {
        Memory::create(&Config::default(), &test_layout()).unwrap()
    }

    #[test]
    fn loads_follow_the_layout() {
        let memory = test_memory();
        assert_eq!(memory.load_u32(0x11000), Ok(0x04030201));
        assert_eq!(memory.load_i8(0x12001), Ok(b'i' as i8));
        // bss reads as zero without ever having been stored
        assert_eq!(memory.load_u32(0x13000), Ok(0));
    }

    #[test]
    fn misaligned_load() {
        let memory = test_memory();
        assert_eq!(
            memory.load_i32(1),
            Err(Fault::misaligned(FaultKind::LoadMisAligned, 1, 4))
        );
        assert_eq!(
            memory.load_i16(0x11001),
            Err(Fault::misaligned(FaultKind::LoadMisAligned, 0x11001, 2))
        );
    }

    #[test]
    fn load_crossing_segment_end_is_out_of_bound() {
        let memory = test_memory();
        // last valid word of bss
        assert!(memory.load_u32(0x1303C).is_ok());
        assert_eq!(
            memory.load_u32(0x13040),
            Err(Fault::out_of_bound(FaultKind::LoadOutOfBound, 0x13040, 4))
        );
    }

    #[test]
    fn stores_respect_section_permissions() {
        let mut memory = test_memory();
        assert_eq!(memory.store_u32(0x11004, 42), Ok(()));
        assert_eq!(memory.load_u32(0x11004), Ok(42));
        assert_eq!(memory.store_u8(0x13001, 9), Ok(()));
        // rodata and text reject stores
        assert_eq!(
            memory.store_u8(0x12000, 0),
            Err(Fault::out_of_bound(FaultKind::StoreOutOfBound, 0x12000, 1))
        );
        assert_eq!(
            memory.store_u32(TEXT_START, 0),
            Err(Fault::out_of_bound(
                FaultKind::StoreOutOfBound,
                TEXT_START,
                4
            ))
        );
    }

    #[test]
    fn stack_is_mapped_below_its_top() {
        let mut memory = test_memory();
        assert_eq!(memory.store_u32(STACK_TOP - 4, 7), Ok(()));
        assert_eq!(memory.load_u32(STACK_TOP - 4), Ok(7));
        assert!(memory.load_u32(STACK_TOP).is_err());
    }

    #[test]
    fn sbrk_grows_and_refuses() {
        let mut memory = test_memory();
        let base = memory.brk();
        assert_eq!(memory.sbrk(16), Some(base));
        assert_eq!(memory.sbrk(0), Some(base + 16));
        assert_eq!(memory.load_u32(base), Ok(0));
        assert_eq!(memory.store_u32(base, 3), Ok(()));
        // shrinking below the heap start is refused
        assert_eq!(memory.sbrk(-1024), None);
        // and so is growing past the heap segment
        assert_eq!(memory.sbrk(i32::max_value()), None);
        assert_eq!(memory.brk(), base + 16);
    }

    #[test]
    fn instruction_fetch_is_text_only() {
        let memory = test_memory();
        assert!(memory.load_cmd(TEXT_START).is_ok());
        assert_eq!(
            memory.load_cmd(TEXT_START + 2),
            Err(Fault::misaligned(
                FaultKind::InsMisAligned,
                TEXT_START + 2,
                4
            ))
        );
        assert_eq!(
            memory.load_cmd(0x11000),
            Err(Fault::out_of_bound(FaultKind::InsOutOfBound, 0x11000, 4))
        );
    }

    #[test]
    fn layout_must_fit() {
        let config = Config {
            storage_size: 0x1000,
            ..Config::default()
        };
        assert!(Memory::create(&config, &test_layout()).is_err());
    }

    #[test]
    fn libc_access_spans() {
        let memory = test_memory();
        assert_eq!(memory.libc_access(0x12000)[..4], b"hi\n\0"[..]);
        assert!(memory.libc_access(0x500).is_empty());
        assert!(memory.libc_access(memory.brk()).is_empty());
    }
}
