//! Per-file assembly: the line protocol, label table, section state and
//! directive handling. Instruction mnemonics live in
//! [`crate::instructions`].

use std::collections::{HashMap, HashSet};

use matches::debug_assert_matches;
use pest::iterators::Pair;
use pest::Parser;

use rvcpu::constants::MAX_ALIGN_SHIFT;

use crate::instructions::process_instruction;
use crate::literals::{process_uint, process_value, unescape_string};
use crate::parser::AsmParser;
use crate::storage::{IntKind, Section, Storage};
use crate::{new_parser_error, Result, Rule};

/// Where a label was defined.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LabelSite {
    pub line: usize,
    /// Index into the file's storage vector; may equal its length.
    pub index: usize,
    pub section: Section,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct LabelData {
    /// `None` while the label is only known from a `.globl`.
    pub site: Option<LabelSite>,
    pub global: bool,
}

/// One assembled source file.
#[derive(Debug)]
pub struct Assembly {
    pub file: String,
    pub storages: Vec<Storage>,
    pub labels: HashMap<String, LabelData>,
    /// Section switch points: `(first storage index, section)`.
    pub sections: Vec<(usize, Section)>,
    current: Option<Section>,
    line: usize,
    warned: HashSet<String>,
}

impl Assembly {
    pub fn parse(file: &str, source: &str) -> Result<Assembly> {
        let program = AsmParser::parse(Rule::program, source)?.next().unwrap();

        let mut assembly = Assembly {
            file: file.to_owned(),
            storages: Vec::new(),
            labels: HashMap::new(),
            sections: Vec::new(),
            current: None,
            line: 0,
            warned: HashSet::new(),
        };

        for line in program.into_inner() {
            match line.as_rule() {
                Rule::line => assembly.process_line(line)?,
                Rule::EOI => {}
                _ => unreachable!(),
            }
        }

        Ok(assembly)
    }

    /// Splits the storage vector at the recorded section switch points.
    /// Slices come back in file order as `(start index, items, section)`.
    pub fn split_by_section(&self) -> Vec<(usize, &[Storage], Section)> {
        let mut slices = Vec::new();
        for (i, &(start, section)) in self.sections.iter().enumerate() {
            let end = self
                .sections
                .get(i + 1)
                .map(|&(next, _)| next)
                .unwrap_or_else(|| self.storages.len());
            slices.push((start, &self.storages[start..end], section));
        }
        slices
    }

    fn process_line(&mut self, pair: Pair<Rule>) -> Result<()> {
        debug_assert_matches!(pair.as_rule(), Rule::line);
        self.line = pair.as_span().start_pos().line_col().0;

        for item in pair.into_inner() {
            match item.as_rule() {
                Rule::label => self.add_label(item)?,
                Rule::statement => {
                    let inner = item.into_inner().next().unwrap();
                    match inner.as_rule() {
                        Rule::directive => self.process_directive(inner)?,
                        Rule::instruction => process_instruction(self, inner)?,
                        _ => unreachable!(),
                    }
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    fn add_label(&mut self, pair: Pair<Rule>) -> Result<()> {
        let span = pair.as_span();
        let name = pair.into_inner().next().unwrap().as_str();

        let section = match self.current {
            Some(section) => section,
            None => {
                return Err(new_parser_error(
                    span,
                    "Label must be defined in a section".to_owned(),
                ))
            }
        };

        let line = self.line;
        let index = self.storages.len();
        let entry = self.labels.entry(name.to_owned()).or_default();
        if let Some(site) = &entry.site {
            return Err(new_parser_error(
                span,
                format!(
                    "Label \"{}\" already exists\nFirst appearance at line {}",
                    name, site.line
                ),
            ));
        }
        entry.site = Some(LabelSite {
            line,
            index,
            section,
        });
        Ok(())
    }

    fn set_section(&mut self, section: Option<Section>) {
        self.current = section;
        if let Some(section) = section {
            self.sections.push((self.storages.len(), section));
        }
    }

    /// Appends a storage item to the current section.
    pub(crate) fn push(&mut self, span: &pest::Span, storage: Storage) -> Result<()> {
        if self.current.is_none() {
            return Err(new_parser_error(
                span.clone(),
                "Storage must be placed in a section".to_owned(),
            ));
        }
        self.storages.push(storage);
        Ok(())
    }

    fn warn_once(&mut self, name: &str) {
        if self.warned.insert(name.to_owned()) {
            eprintln!("warning: attribute ignored: .{}", name);
        }
    }

    fn process_directive(&mut self, pair: Pair<Rule>) -> Result<()> {
        debug_assert_matches!(pair.as_rule(), Rule::directive);
        let span = pair.as_span();
        let mut inner = pair.into_inner();
        let head = inner.next().unwrap();
        let name = head.as_str()[1..].to_owned();

        // Unwrap each `argument` down to its concrete alternative.
        let args: Vec<Pair<Rule>> = inner
            .next()
            .map(|arguments| {
                arguments
                    .into_inner()
                    .map(|argument| argument.into_inner().next().unwrap())
                    .collect()
            })
            .unwrap_or_default();

        let expect_args = |count: usize| -> Result<()> {
            if args.len() == count {
                Ok(())
            } else {
                Err(new_parser_error(
                    span.clone(),
                    format!(".{} expects {} operand(s)", name, count),
                ))
            }
        };

        match name.as_str() {
            "text" => {
                expect_args(0)?;
                self.set_section(Some(Section::Text));
            }
            "data" | "sdata" => {
                expect_args(0)?;
                self.set_section(Some(Section::Data));
            }
            "rodata" | "srodata" => {
                expect_args(0)?;
                self.set_section(Some(Section::Rodata));
            }
            "bss" | "sbss" => {
                expect_args(0)?;
                self.set_section(Some(Section::Bss));
            }
            "section" => {
                let target = args.first().map(|arg| arg.as_str()).unwrap_or("");
                let target = target.strip_prefix('.').unwrap_or(target);
                let section = match target {
                    "text" => Some(Section::Text),
                    "data" | "sdata" => Some(Section::Data),
                    "rodata" | "srodata" => Some(Section::Rodata),
                    "bss" | "sbss" => Some(Section::Bss),
                    other => {
                        eprintln!("warning: unknown section: {}", other);
                        None
                    }
                };
                self.set_section(section);
            }
            "globl" | "global" => {
                expect_args(1)?;
                let label = args[0].as_str();
                self.labels.entry(label.to_owned()).or_default().global = true;
            }
            "align" | "p2align" => {
                expect_args(1)?;
                let shift = process_uint(&args[0], MAX_ALIGN_SHIFT)?;
                self.push(&span, Storage::Alignment(1 << shift))?;
            }
            "balign" => {
                expect_args(1)?;
                let alignment = process_uint(&args[0], 1 << MAX_ALIGN_SHIFT)?;
                self.push(&span, Storage::Alignment((alignment as u32).max(1)))?;
            }
            "byte" => self.push_integers(&span, &args, IntKind::Byte)?,
            "half" | "short" | "2byte" => self.push_integers(&span, &args, IntKind::Half)?,
            "word" | "long" | "4byte" => self.push_integers(&span, &args, IntKind::Word)?,
            "string" | "asciz" => {
                expect_args(1)?;
                if args[0].as_rule() != Rule::string {
                    return Err(new_parser_error(
                        args[0].as_span(),
                        "Expected a quoted string".to_owned(),
                    ));
                }
                let body = args[0].clone().into_inner().next().unwrap();
                let bytes = unescape_string(body.as_str())
                    .map_err(|message| new_parser_error(body.as_span(), message))?;
                self.push(&span, Storage::Asciz(bytes))?;
            }
            "zero" => {
                expect_args(1)?;
                let count = process_uint(&args[0], 1 << 32)?;
                self.push(&span, Storage::ZeroBytes(count as u32))?;
            }
            "size" | "type" | "file" | "attribute" => {}
            _ => self.warn_once(&name),
        }
        Ok(())
    }

    fn push_integers(
        &mut self,
        span: &pest::Span,
        args: &[Pair<Rule>],
        kind: IntKind,
    ) -> Result<()> {
        if args.is_empty() {
            return Err(new_parser_error(
                span.clone(),
                "Expected at least one value".to_owned(),
            ));
        }
        for arg in args {
            let value = process_value(arg)?;
            self.push(span, Storage::Integer { kind, value })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::Value;

    fn parse(source: &str) -> Assembly {
        Assembly::parse("test.s", source).unwrap()
    }

    #[test]
    fn sections_and_data() {
        let assembly = parse(
            ".data\n\
             counts: .word 1, -2, 0x30\n\
             .rodata\n\
             msg: .asciz \"hi\\n\"\n\
             .bss\n\
             buffer: .zero 64\n",
        );

        assert_eq!(assembly.storages.len(), 5);
        assert_eq!(
            assembly.storages[0],
            Storage::Integer {
                kind: IntKind::Word,
                value: Value::Int(1)
            }
        );
        assert_eq!(
            assembly.storages[1],
            Storage::Integer {
                kind: IntKind::Word,
                value: Value::Int(-2)
            }
        );
        assert_eq!(assembly.storages[3], Storage::Asciz(b"hi\n".to_vec()));
        assert_eq!(assembly.storages[4], Storage::ZeroBytes(64));

        let slices = assembly.split_by_section();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].2, Section::Data);
        assert_eq!(slices[0].1.len(), 3);
        assert_eq!(slices[1].2, Section::Rodata);
        assert_eq!(slices[2].2, Section::Bss);

        let msg = &assembly.labels["msg"];
        assert_eq!(msg.site.as_ref().unwrap().section, Section::Rodata);
        assert_eq!(msg.site.as_ref().unwrap().index, 3);
    }

    #[test]
    fn globl_before_and_after_definition() {
        let assembly = parse(
            ".globl main\n\
             .text\n\
             main: ret\n\
             .globl helper\n\
             helper: ret\n",
        );
        assert!(assembly.labels["main"].global);
        assert!(assembly.labels["main"].site.is_some());
        assert!(assembly.labels["helper"].global);
    }

    #[test]
    fn label_outside_section_is_fatal() {
        assert!(Assembly::parse("test.s", "orphan: .text\n").is_err());
    }

    #[test]
    fn duplicate_label_is_fatal() {
        let err = Assembly::parse("test.s", ".text\nfoo:\nfoo: ret\n").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn alignment_bounds() {
        let assembly = parse(".data\n.align 0\n.p2align 3\n.balign 2\n");
        assert_eq!(assembly.storages[0], Storage::Alignment(1));
        assert_eq!(assembly.storages[1], Storage::Alignment(8));
        assert_eq!(assembly.storages[2], Storage::Alignment(2));
        assert!(Assembly::parse("test.s", ".data\n.align 20\n").is_err());
    }

    #[test]
    fn ignored_and_unknown_directives() {
        let assembly = parse(
            ".file \"x.c\"\n\
             .attribute arch, \"rv32im\"\n\
             .text\n\
             .type main, @function\n\
             main: ret\n\
             .size main, .-main\n\
             .wobble 3\n",
        );
        assert_eq!(assembly.storages.len(), 1);
    }

    #[test]
    fn section_directive_spellings() {
        let assembly = parse(".section .text\nmain: ret\n.section sdata\n.word 1\n");
        let slices = assembly.split_by_section();
        assert_eq!(slices[0].2, Section::Text);
        assert_eq!(slices[1].2, Section::Data);
    }

    #[test]
    fn comments_and_blank_lines() {
        let assembly = parse(
            "# leading comment\n\
             \n\
             .text  # trailing\n\
             main:  # label line\n\
             \tret\n",
        );
        assert_eq!(assembly.storages.len(), 1);
        assert_eq!(assembly.labels["main"].site.as_ref().unwrap().index, 0);
    }

    #[test]
    fn data_symbol_reference() {
        let assembly = parse(".data\nptr: .word target\n.text\ntarget: ret\n");
        assert_eq!(
            assembly.storages[0],
            Storage::Integer {
                kind: IntKind::Word,
                value: Value::Symbol("target".to_owned())
            }
        );
    }

    #[test]
    fn char_literal_data() {
        let assembly = parse(".data\n.byte 'a', '\\n', ','\n");
        assert_eq!(
            assembly.storages[0],
            Storage::Integer {
                kind: IntKind::Byte,
                value: Value::Int(b'a' as i64)
            }
        );
        assert_eq!(
            assembly.storages[1],
            Storage::Integer {
                kind: IntKind::Byte,
                value: Value::Int(b'\n' as i64)
            }
        );
        assert_eq!(
            assembly.storages[2],
            Storage::Integer {
                kind: IntKind::Byte,
                value: Value::Int(b',' as i64)
            }
        );
    }
}
