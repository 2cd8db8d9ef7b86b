use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use mpegts::{Pid, PesToTs};

#[derive(Debug)]
struct AppArgs {
    pid: Pid,
    input: PathBuf,
    output: PathBuf,
}

impl AppArgs {
    const HELP: &str = "\
PESストリームをTSに変換するコマンド

USAGE:
  pes2ts [OPTIONS] <INPUT> <OUTPUT>

FLAGS:
  -h, --help このヘルプを表示する

OPTIONS:
  --pid <PID> 出力するTSのPID（既定値：0x100）

ARGS:
  <INPUT>     変換するPESファイルのパス
  <OUTPUT>    出力するTSファイルのパス
";

    pub fn parse() -> Result<AppArgs, Box<dyn std::error::Error>> {
        let mut args = pico_args::Arguments::from_env();

        if args.contains(["-h", "--help"]) {
            print!("{}", Self::HELP);
            std::process::exit(0);
        }

        let pid = args
            .opt_value_from_fn("--pid", parse_pid)?
            .unwrap_or(Pid::new(0x0100));

        Ok(AppArgs {
            pid,
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

    let mut input = BufReader::new(File::open(&args.input)?);
    let mut output = BufWriter::new(File::create(&args.output)?);

    let mut p2t = PesToTs::new(args.pid);
    let mut packets = 0_u64;
    let mut result = Ok(());
    let mut buf = vec![0; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        p2t.write(&buf[..n], |packet| {
            if result.is_ok() {
                result = output.write_all(&packet.0);
                packets += 1;
            }
        });
        result?;
        result = Ok(());
    }
    p2t.flush(|packet| {
        if result.is_ok() {
            result = output.write_all(&packet.0);
            packets += 1;
        }
    });
    result?;
    output.flush()?;

    log::info!("wrote {} packets", packets);
    Ok(())
}
