//! The in-memory linker.
//!
//! Five stages over the assembled units: global symbol binding (libc names
//! included), section assembly, size estimation, call relaxation, and byte
//! emission. Symbol locations are `(section, item index)` handles resolved
//! against the per-section base addresses and offset tables, so label
//! references survive address recomputation between stages.

use std::collections::HashMap;

use byteorder::ByteOrder;
use util::Endian;

use rvcpu::command::Command;
use rvcpu::constants::{SECTION_ALIGN, TEXT_START};
use rvcpu::layout::{MemoryLayout, Segment};
use rvcpu::{libc, Register};

use crate::assembler::Assembly;
use crate::error::LinkError;
use crate::storage::{Instruction, IntKind, Section, Storage, Value};

struct Item<'a> {
    unit: usize,
    storage: &'a Storage,
}

#[derive(Default)]
struct SectionData<'a> {
    items: Vec<Item<'a>>,
    /// One entry per item plus a trailing sentinel: offsets from the
    /// section base, recomputed by every estimate pass.
    offsets: Vec<u32>,
    base: u32,
    size: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Location {
    /// A libc stub address, fixed up front.
    Absolute(u32),
    /// An item handle; its address moves until the last estimate pass.
    Item { section: Section, index: usize },
}

struct Linker<'a> {
    units: &'a [Assembly],
    sections: [SectionData<'a>; 4],
    globals: HashMap<String, Location>,
    locals: Vec<HashMap<String, Location>>,
    /// Parallel to the text items: which calls shrank to a single `jal`.
    relaxed: Vec<bool>,
}

fn align_up(position: u32, alignment: u32) -> u32 {
    (position + alignment - 1) / alignment * alignment
}

/// `%hi`/`%lo` split of a pc-relative offset: `lo` is the sign-extended
/// low 12 bits, `hi` the remaining (already shifted) upper part.
fn split_hi_lo(delta: i32) -> (i32, i32) {
    let lo = (delta << 20) >> 20;
    (delta.wrapping_sub(lo), lo)
}

fn fits_branch(delta: i64) -> bool {
    delta % 2 == 0 && (-4096..4096).contains(&delta)
}

fn fits_jump(delta: i64) -> bool {
    delta % 2 == 0 && (-(1 << 20)..(1 << 20)).contains(&delta)
}

fn fits_i12(value: i64) -> bool {
    (-2048..2048).contains(&value)
}

fn push_word(buffer: &mut Vec<u8>, word: u32) {
    let mut bytes = [0u8; 4];
    Endian::write_u32(&mut bytes, word);
    buffer.extend_from_slice(&bytes);
}

impl<'a> Linker<'a> {
    fn new(units: &'a [Assembly]) -> Linker<'a> {
        Linker {
            units,
            sections: Default::default(),
            globals: HashMap::new(),
            locals: Vec::new(),
            relaxed: Vec::new(),
        }
    }

    /// Stage 1 and 2 for one unit: append its storage slices to the global
    /// sections and bind its labels to item handles.
    fn add_file(&mut self, unit: usize) -> Result<(), LinkError> {
        let assembly = &self.units[unit];

        // (file start, length, section, index of the first appended item)
        let mut slices = Vec::new();
        for (start, storages, section) in assembly.split_by_section() {
            let data = &mut self.sections[section.index()];
            slices.push((start, storages.len(), section, data.items.len()));
            for storage in storages {
                data.items.push(Item { unit, storage });
            }
        }

        let mut local = HashMap::new();
        for (name, label) in assembly.labels.iter() {
            let site = match &label.site {
                Some(site) => site,
                None => {
                    if label.global {
                        return Err(LinkError::UndefinedGlobal {
                            name: name.clone(),
                            file: assembly.file.clone(),
                        });
                    }
                    continue;
                }
            };

            // The last slice of the label's own section whose range contains
            // the label index. A label at the end of a run matches with
            // `site.index == start + length` and lands on the per-section
            // sentinel offset, so end-of-section markers keep their address.
            let mut location = None;
            for &(start, length, section, base) in slices.iter() {
                if section == site.section && site.index >= start && site.index <= start + length {
                    location = Some(Location::Item {
                        section,
                        index: base + (site.index - start),
                    });
                }
            }
            let location = location.expect("a defined label always lies in a slice");

            if label.global {
                if self.globals.insert(name.clone(), location).is_some() {
                    return Err(LinkError::DuplicateSymbol { name: name.clone() });
                }
            } else {
                local.insert(name.clone(), location);
            }
        }
        self.locals.push(local);
        Ok(())
    }

    /// Registers every libc name at its synthetic stub address.
    fn add_libc(&mut self) -> Result<(), LinkError> {
        for (index, name) in libc::NAMES.iter().enumerate() {
            let address = TEXT_START + index as u32 * 4;
            if self
                .globals
                .insert((*name).to_owned(), Location::Absolute(address))
                .is_some()
            {
                return Err(LinkError::LibcConflict {
                    name: (*name).to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Stage 3: walk every section in order, recording item offsets and
    /// section bases. Rerun after relaxation shrinks anything.
    fn estimate(&mut self) {
        let mut cursor = libc::end();
        for section in Section::ALL.iter() {
            let index = section.index();
            if index != Section::Text.index() {
                cursor = align_up(cursor, SECTION_ALIGN);
            }

            let relaxed = &self.relaxed;
            let data = &mut self.sections[index];
            data.base = cursor;

            let mut position = 0u32;
            let mut offsets = Vec::with_capacity(data.items.len() + 1);
            for (i, item) in data.items.iter().enumerate() {
                position = align_up(position, item.storage.align());
                offsets.push(position);
                let shrunk = index == Section::Text.index() && relaxed[i];
                position += item.storage.size(shrunk);
            }
            offsets.push(position);

            data.offsets = offsets;
            data.size = position;
            cursor += position;
        }
    }

    fn address(&self, location: Location) -> u32 {
        match location {
            Location::Absolute(address) => address,
            Location::Item { section, index } => {
                let data = &self.sections[section.index()];
                data.base + data.offsets[index]
            }
        }
    }

    fn resolve(&self, name: &str, unit: usize) -> Option<u32> {
        self.locals[unit]
            .get(name)
            .or_else(|| self.globals.get(name))
            .map(|&location| self.address(location))
    }

    fn lookup(&self, name: &str, unit: usize) -> Result<u32, LinkError> {
        self.resolve(name, unit).ok_or_else(|| LinkError::Undefined {
            name: name.to_owned(),
        })
    }

    /// Stage 4: shrink every `call`/`tail` whose target fits the 21-bit
    /// `jal` range. Shrinking only moves targets closer, so one pass
    /// converges; returns whether anything changed.
    fn relax(&mut self) -> bool {
        let text = &self.sections[Section::Text.index()];
        let mut shrink = Vec::new();
        for (i, item) in text.items.iter().enumerate() {
            if self.relaxed[i] {
                continue;
            }
            if let Storage::Call { target, .. } = item.storage {
                let pc = text.base + text.offsets[i];
                if let Some(address) = self.resolve(target, item.unit) {
                    if fits_jump(address as i64 - pc as i64) {
                        shrink.push(i);
                    }
                }
            }
        }
        let changed = !shrink.is_empty();
        for i in shrink {
            self.relaxed[i] = true;
        }
        changed
    }

    fn target_delta(&self, target: &Value, pc: u32, unit: usize) -> Result<i64, LinkError> {
        match target {
            Value::Int(offset) => Ok(*offset),
            Value::Symbol(name) => Ok(self.lookup(name, unit)? as i64 - pc as i64),
        }
    }

    fn encode_instruction(
        &self,
        instruction: &Instruction,
        pc: u32,
        unit: usize,
    ) -> Result<u32, LinkError> {
        let out_of_range = |value: i64| LinkError::ImmediateOutOfRange { pc, value };

        let command = match instruction {
            Instruction::ArithReg { op, rd, rs1, rs2 } => Command::Arith {
                op: *op,
                rd: *rd,
                rs1: *rs1,
                rs2: *rs2,
            },
            Instruction::ArithImm { op, rd, rs1, imm } => {
                use rvcpu::command::ArithOp::*;
                let valid = match op {
                    Sll | Srl | Sra => (0..32).contains(imm),
                    _ => fits_i12(*imm as i64),
                };
                if !valid {
                    return Err(out_of_range(*imm as i64));
                }
                Command::ArithImm {
                    op: *op,
                    rd: *rd,
                    rs1: *rs1,
                    imm: *imm,
                }
            }
            Instruction::Load {
                op,
                rd,
                base,
                offset,
            } => {
                if !fits_i12(*offset as i64) {
                    return Err(out_of_range(*offset as i64));
                }
                Command::Load {
                    op: *op,
                    rd: *rd,
                    rs1: *base,
                    imm: *offset,
                }
            }
            Instruction::Store {
                op,
                rs2,
                base,
                offset,
            } => {
                if !fits_i12(*offset as i64) {
                    return Err(out_of_range(*offset as i64));
                }
                Command::Store {
                    op: *op,
                    rs1: *base,
                    rs2: *rs2,
                    imm: *offset,
                }
            }
            Instruction::Branch {
                op,
                rs1,
                rs2,
                target,
            } => {
                let delta = self.target_delta(target, pc, unit)?;
                if !fits_branch(delta) {
                    return Err(out_of_range(delta));
                }
                Command::Branch {
                    op: *op,
                    rs1: *rs1,
                    rs2: *rs2,
                    imm: delta as i32,
                }
            }
            Instruction::Jal { rd, target } => {
                let delta = self.target_delta(target, pc, unit)?;
                if !fits_jump(delta) {
                    return Err(out_of_range(delta));
                }
                Command::Jal {
                    rd: *rd,
                    imm: delta as i32,
                }
            }
            Instruction::Jalr { rd, base, offset } => {
                if !fits_i12(*offset as i64) {
                    return Err(out_of_range(*offset as i64));
                }
                Command::Jalr {
                    rd: *rd,
                    rs1: *base,
                    imm: *offset,
                }
            }
            Instruction::Lui { rd, imm } => {
                if !(0..=0xF_FFFF).contains(imm) {
                    return Err(out_of_range(*imm as i64));
                }
                Command::Lui {
                    rd: *rd,
                    imm: ((*imm as u32) << 12) as i32,
                }
            }
            Instruction::Auipc { rd, imm } => {
                if !(0..=0xF_FFFF).contains(imm) {
                    return Err(out_of_range(*imm as i64));
                }
                Command::Auipc {
                    rd: *rd,
                    imm: ((*imm as u32) << 12) as i32,
                }
            }
        };
        Ok(command.encode())
    }

    fn emit_item(
        &self,
        item: &Item,
        relaxed: bool,
        pc: u32,
        buffer: &mut Vec<u8>,
    ) -> Result<(), LinkError> {
        match item.storage {
            Storage::Alignment(_) => {}
            Storage::Integer { kind, value } => {
                let value: i64 = match value {
                    Value::Int(value) => *value,
                    Value::Symbol(name) => i64::from(self.lookup(name, item.unit)?),
                };
                match kind {
                    IntKind::Byte => buffer.push(value as u8),
                    IntKind::Half => {
                        let mut bytes = [0u8; 2];
                        Endian::write_u16(&mut bytes, value as u16);
                        buffer.extend_from_slice(&bytes);
                    }
                    IntKind::Word => {
                        let mut bytes = [0u8; 4];
                        Endian::write_u32(&mut bytes, value as u32);
                        buffer.extend_from_slice(&bytes);
                    }
                }
            }
            Storage::Asciz(bytes) => {
                buffer.extend_from_slice(bytes);
                buffer.push(0);
            }
            Storage::ZeroBytes(count) => {
                buffer.resize(buffer.len() + *count as usize, 0);
            }
            Storage::Instr(instruction) => {
                let word = self.encode_instruction(instruction, pc, item.unit)?;
                push_word(buffer, word);
            }
            Storage::Call { tail, target } => {
                let address = self.lookup(target, item.unit)?;
                let delta = address.wrapping_sub(pc) as i32;
                if relaxed {
                    let rd = if *tail { Register::Zero } else { Register::Ra };
                    push_word(buffer, Command::Jal { rd, imm: delta }.encode());
                } else {
                    let (hi, lo) = split_hi_lo(delta);
                    let (scratch, rd) = if *tail {
                        (Register::T1, Register::Zero)
                    } else {
                        (Register::Ra, Register::Ra)
                    };
                    push_word(buffer, Command::Auipc { rd: scratch, imm: hi }.encode());
                    push_word(
                        buffer,
                        Command::Jalr {
                            rd,
                            rs1: scratch,
                            imm: lo,
                        }
                        .encode(),
                    );
                }
            }
            Storage::LoadAddress { rd, target } => {
                let address = self.lookup(target, item.unit)?;
                let delta = address.wrapping_sub(pc) as i32;
                let (hi, lo) = split_hi_lo(delta);
                push_word(buffer, Command::Auipc { rd: *rd, imm: hi }.encode());
                push_word(
                    buffer,
                    Command::ArithImm {
                        op: rvcpu::command::ArithOp::Add,
                        rd: *rd,
                        rs1: *rd,
                        imm: lo,
                    }
                    .encode(),
                );
            }
        }
        Ok(())
    }

    /// Stage 5: emit the section images and the resolved symbol table.
    fn emit(&self) -> Result<MemoryLayout, LinkError> {
        let stub_bytes = (libc::end() - TEXT_START) as usize;
        let mut images = vec![vec![0u8; stub_bytes], Vec::new(), Vec::new()];

        for section in [Section::Text, Section::Data, Section::Rodata].iter() {
            let index = section.index();
            let data = &self.sections[index];
            let lead = if index == Section::Text.index() {
                stub_bytes
            } else {
                0
            };
            let buffer = &mut images[index];

            for (i, item) in data.items.iter().enumerate() {
                buffer.resize(lead + data.offsets[i] as usize, 0);
                let pc = data.base + data.offsets[i];
                let relaxed = index == Section::Text.index() && self.relaxed[i];
                self.emit_item(item, relaxed, pc, buffer)?;
            }
            buffer.resize(lead + data.size as usize, 0);
        }

        // bss items are sized, never stored; the memory layer zero-fills.

        let mut position_table = HashMap::new();
        for (name, &location) in self.globals.iter() {
            position_table.insert(name.clone(), self.address(location));
        }
        if !position_table.contains_key("main") {
            return Err(LinkError::MissingMain);
        }

        let rodata_image = images.pop().unwrap();
        let data_image = images.pop().unwrap();
        let text_image = images.pop().unwrap();

        let layout = MemoryLayout {
            text: Segment {
                start: TEXT_START,
                data: text_image,
            },
            data: Segment {
                start: self.sections[Section::Data.index()].base,
                data: data_image,
            },
            rodata: Segment {
                start: self.sections[Section::Rodata.index()].base,
                data: rodata_image,
            },
            bss_start: self.sections[Section::Bss.index()].base,
            bss_size: self.sections[Section::Bss.index()].size,
            position_table,
        };

        if layout.text.end() > layout.data.start
            || layout.data.end() > layout.rodata.start
            || layout.rodata.end() > layout.bss_start
        {
            return Err(LinkError::Overlap);
        }
        Ok(layout)
    }
}

/// Links the assembled units into an executable memory layout.
pub fn link(units: &[Assembly]) -> Result<MemoryLayout, LinkError> {
    let mut linker = Linker::new(units);
    for unit in 0..units.len() {
        linker.add_file(unit)?;
    }
    linker.add_libc()?;
    linker.relaxed = vec![false; linker.sections[Section::Text.index()].items.len()];

    linker.estimate();
    if linker.relax() {
        linker.estimate();
    }
    linker.emit()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembler::Assembly;

    fn parse(source: &str) -> Assembly {
        Assembly::parse("test.s", source).unwrap()
    }

    fn word_at(segment: &Segment, address: u32) -> u32 {
        let offset = (address - segment.start) as usize;
        Endian::read_u32(&segment.data[offset..offset + 4])
    }

    #[test]
    fn main_lands_after_the_stub_table() {
        let units = [parse(".globl main\n.text\nmain: ret\n")];
        let layout = link(&units).unwrap();
        assert_eq!(layout.resolve("main"), Some(libc::end()));
        // jalr zero, ra, 0
        assert_eq!(word_at(&layout.text, libc::end()), 0x0000_8067);
    }

    #[test]
    fn missing_main_is_fatal() {
        let units = [parse(".globl start\n.text\nstart: ret\n")];
        assert_eq!(link(&units), Err(LinkError::MissingMain));
    }

    #[test]
    fn near_call_relaxes_to_jal() {
        let units = [parse(
            ".globl main\n.text\nmain: call helper\nret\nhelper: ret\n",
        )];
        let layout = link(&units).unwrap();
        let main = layout.resolve("main").unwrap();
        // relaxed: jal ra, +8 (call is 4 bytes, ret follows, helper after)
        let word = word_at(&layout.text, main);
        assert_eq!(word & 0x7F, 0b110_1111);
        assert_eq!((word >> 7) & 0x1F, Register::Ra as u32);
        // helper sits two instructions further
        assert_eq!(word_at(&layout.text, main + 4), 0x0000_8067);
    }

    #[test]
    fn far_call_keeps_the_long_form() {
        let units = [parse(
            ".globl main\n.text\nmain: call far\n.zero 2097152\nfar: ret\n",
        )];
        let layout = link(&units).unwrap();
        let main = layout.resolve("main").unwrap();
        let first = word_at(&layout.text, main);
        let second = word_at(&layout.text, main + 4);
        // auipc ra, ... ; jalr ra, ra, ...
        assert_eq!(first & 0x7F, 0b001_0111);
        assert_eq!(second & 0x7F, 0b110_0111);
        let hi = first & 0xFFFF_F000;
        let lo = (second as i32) >> 20;
        let target = main.wrapping_add(hi).wrapping_add(lo as u32);
        assert_eq!(target, layout.resolve("far").unwrap());
    }

    #[test]
    fn cross_file_symbols_resolve() {
        let units = [
            parse(".globl main\n.text\nmain: call helper\nret\n"),
            parse(".globl helper\n.text\nhelper: li a0, 1\nret\n"),
        ];
        let layout = link(&units).unwrap();
        assert!(layout.resolve("helper").is_some());
    }

    #[test]
    fn local_labels_stay_file_scoped() {
        // both files define a local `loop`; linking must succeed
        let units = [
            parse(".globl main\n.text\nmain:\nloop: j loop\n"),
            parse(".globl other\n.text\nother:\nloop: j loop\n"),
        ];
        assert!(link(&units).is_ok());

        // but two global definitions collide
        let units = [
            parse(".globl main\n.text\nmain: ret\n"),
            parse(".globl main\n.text\nmain: ret\n"),
        ];
        assert_eq!(
            link(&units),
            Err(LinkError::DuplicateSymbol {
                name: "main".to_owned()
            })
        );
    }

    #[test]
    fn libc_names_are_reserved() {
        let units = [parse(".globl main\n.globl printf\n.text\nmain: ret\nprintf: ret\n")];
        assert_eq!(
            link(&units),
            Err(LinkError::LibcConflict {
                name: "printf".to_owned()
            })
        );
    }

    #[test]
    fn undefined_global_is_fatal() {
        let units = [parse(".globl main\n.globl ghost\n.text\nmain: ret\n")];
        assert_eq!(
            link(&units),
            Err(LinkError::UndefinedGlobal {
                name: "ghost".to_owned(),
                file: "test.s".to_owned()
            })
        );
    }

    #[test]
    fn undefined_call_target_is_fatal() {
        let units = [parse(".globl main\n.text\nmain: call nowhere\n")];
        assert_eq!(
            link(&units),
            Err(LinkError::Undefined {
                name: "nowhere".to_owned()
            })
        );
    }

    #[test]
    fn sections_are_page_aligned_and_ordered() {
        let units = [parse(
            ".globl main\n.text\nmain: ret\n.data\n.word 1\n.rodata\n.word 2\n.bss\n.zero 8\n",
        )];
        let layout = link(&units).unwrap();
        assert!(layout.text.end() <= layout.data.start);
        assert_eq!(layout.data.start % SECTION_ALIGN, 0);
        assert_eq!(layout.rodata.start % SECTION_ALIGN, 0);
        assert_eq!(layout.bss_start % SECTION_ALIGN, 0);
        assert!(layout.data.end() <= layout.rodata.start);
        assert!(layout.rodata.end() <= layout.bss_start);
        assert_eq!(layout.bss_size, 8);
    }

    #[test]
    fn alignment_items_pad_their_section() {
        let units = [parse(
            ".globl main\n.text\nmain: ret\n.data\n.byte 1\n.align 2\nvalue: .word 7\n",
        )];
        let layout = link(&units).unwrap();
        assert_eq!(layout.data.data[0], 1);
        assert_eq!(&layout.data.data[1..4], &[0, 0, 0]);
        assert_eq!(Endian::read_u32(&layout.data.data[4..8]), 7);
    }

    #[test]
    fn end_of_section_label_keeps_its_section() {
        let units = [parse(
            ".data\n\
             buf: .zero 16\n\
             .globl buf_end\n\
             buf_end:\n\
             .text\n\
             .globl main\n\
             main: ret\n",
        )];
        let layout = link(&units).unwrap();
        // the marker sits at the data-section sentinel, not at main
        assert_eq!(layout.resolve("buf_end"), Some(layout.data.start + 16));
        assert_ne!(layout.resolve("buf_end"), layout.resolve("main"));
    }

    #[test]
    fn data_symbols_take_absolute_addresses() {
        let units = [parse(
            ".globl main\n.globl target\n.data\nptr: .word target\n.text\nmain: ret\ntarget: ret\n",
        )];
        let layout = link(&units).unwrap();
        let target = layout.resolve("target").unwrap();
        assert_eq!(Endian::read_u32(&layout.data.data[0..4]), target);
    }

    #[test]
    fn linking_is_deterministic() {
        let source = ".globl main\n.text\nmain: call helper\nret\nhelper: li a0, 77\nret\n.data\n.word 1, 2, 3\n";
        let first = link(&[parse(source)]).unwrap();
        let second = link(&[parse(source)]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn branch_out_of_range_is_fatal() {
        let units = [parse(
            ".globl main\n.text\nmain: beq a0, a1, far\n.zero 8192\nfar: ret\n",
        )];
        match link(&units) {
            Err(LinkError::ImmediateOutOfRange { .. }) => {}
            other => panic!("expected ImmediateOutOfRange, got {:?}", other),
        }
    }
}
