use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use mpegts::repack::DEFAULT_MAX_PACKET;
use mpegts::{Packet, Pid, TsToPes};

#[derive(Debug)]
struct AppArgs {
    pid: Pid,
    max: usize,
    input: PathBuf,
    output: PathBuf,
}

impl AppArgs {
    const HELP: &str = "\
TSから1つのPIDを取り出し、デコーダー向けのPESに詰め直すコマンド

USAGE:
  ts2pes [OPTIONS] --pid <PID> <INPUT> <OUTPUT>

FLAGS:
  -h, --help    このヘルプを表示する

OPTIONS:
  --pid <PID>   取り出すPID
  --max <BYTES> 出力するPESの最大長（既定値：2048）

ARGS:
  <INPUT>       読み込むTSファイルのパス
  <OUTPUT>      出力するPESファイルのパス
";

    pub fn parse() -> Result<AppArgs, Box<dyn std::error::Error>> {
        let mut args = pico_args::Arguments::from_env();

        if args.contains(["-h", "--help"]) {
            print!("{}", Self::HELP);
            std::process::exit(0);
        }

        let pid = args.value_from_fn("--pid", parse_pid)?;
        let max = args.opt_value_from_str("--max")?.unwrap_or(DEFAULT_MAX_PACKET);

        Ok(AppArgs {
            pid,
            max,
            input: args.free_from_str()?,
            output: args.free_from_str()?,
        })
    }
}

fn parse_pid(s: &str) -> Result<Pid, String> {
    let value = match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())?;
    Pid::try_new(value).ok_or_else(|| format!("PID out of range: {}", value))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = AppArgs::parse()?;

    env_logger::init();

    let input = BufReader::with_capacity(188 * 1024, File::open(&args.input)?);
    let mut output = BufWriter::new(File::create(&args.output)?);

    let mut ts2pes = TsToPes::new(args.max);
    let mut written = 0_u64;
    let mut dropped = 0_u64;
    let mut result = Ok(());
    let mut write = |pes: &[u8]| {
        if result.is_ok() {
            result = output.write_all(pes);
            written += 1;
        }
    };

    let mut last_cc = 0x10;
    for packet in Packet::iter(input) {
        let packet = packet?;
        if packet.pid() != args.pid {
            continue;
        }
        if !packet.validate_cc(&mut last_cc) {
            log::debug!("continuity error on {:?}", args.pid);
        }
        if !ts2pes.write_packet(&packet, &mut write) {
            dropped += 1;
        }
    }
    ts2pes.flush(&mut write);
    drop(write);
    result?;
    output.flush()?;

    log::info!("wrote {} PES packets, skipped {} TS packets", written, dropped);
    Ok(())
}
