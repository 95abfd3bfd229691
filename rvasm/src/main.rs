#[macro_use]
extern crate clap;

use std::fs::File;
use std::io::prelude::*;
use std::io::{self, BufReader};
use std::path::Path;
use std::process;

use anyhow::{anyhow, Context};
use clap::Arg;

use rvasm::error::source_window;
use rvasm::{link, Assembly};
use rvcpu::memory::Memory;
use rvcpu::{interpreter, Config, Device};

fn main() {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("INPUT")
                .help("Assembly source files to run")
                .required(true)
                .multiple(true)
                .index(1),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .value_name("N")
                .help("Abort after N executed instructions"),
        )
        .arg(
            Arg::with_name("stack")
                .long("stack")
                .takes_value(true)
                .value_name("BYTES")
                .help("Stack size in bytes"),
        )
        .arg(
            Arg::with_name("storage")
                .long("storage")
                .takes_value(true)
                .value_name("BYTES")
                .help("Total guest memory budget in bytes"),
        )
        .arg(
            Arg::with_name("predictor")
                .long("predictor")
                .help("Enable the branch predictor"),
        )
        .arg(
            Arg::with_name("detail")
                .long("detail")
                .help("Print a per-opcode breakdown after the run"),
        )
        .arg(
            Arg::with_name("silent")
                .long("silent")
                .help("Suppress the final summary line"),
        )
        .get_matches();

    if let Err(err) = run(&matches) {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}

fn numeric_option<T: std::str::FromStr>(
    matches: &clap::ArgMatches,
    name: &str,
    default: T,
) -> anyhow::Result<T> {
    match matches.value_of(name) {
        Some(text) => text
            .parse()
            .map_err(|_| anyhow!("invalid --{} value: \"{}\"", name, text)),
        None => Ok(default),
    }
}

fn run(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let defaults = Config::default();
    let config = Config {
        timeout: numeric_option(matches, "timeout", defaults.timeout)?,
        stack_size: numeric_option(matches, "stack", defaults.stack_size)?,
        storage_size: numeric_option(matches, "storage", defaults.storage_size)?,
        predictor: matches.is_present("predictor"),
        detail: matches.is_present("detail"),
        ..defaults
    };

    let mut units = Vec::new();
    for path in matches.values_of("INPUT").unwrap() {
        units.push(assemble_file(path)?);
    }

    let layout = link(&units)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();
    let mut device = Device::new(&config, &mut input, &mut output);
    let mut memory = Memory::create(&config, &layout)?;

    let value = interpreter::run(&config, &layout, &mut memory, &mut device)
        .map_err(|fault| anyhow!("{}", fault))?;

    if !matches.is_present("silent") {
        println!("Program returned: {}", value);
    }
    eprint!("{}", device.report(config.detail));
    Ok(())
}

fn assemble_file(path: &str) -> anyhow::Result<Assembly> {
    let file = File::open(Path::new(path)).with_context(|| format!("failed to open {}", path))?;
    let mut source = String::new();
    BufReader::new(file)
        .read_to_string(&mut source)
        .with_context(|| format!("failed to read {}", path))?;

    Assembly::parse(path, &source).map_err(|err| {
        let line = match err.line_col {
            pest::error::LineColLocation::Pos((line, _)) => line,
            pest::error::LineColLocation::Span((line, _), _) => line,
        };
        anyhow!(
            "failed to parse {}:\n{}\n{}",
            path,
            err.with_path(path),
            source_window(&source, line)
        )
    })
}
