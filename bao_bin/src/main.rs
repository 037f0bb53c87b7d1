#[macro_use]
extern crate arrayref;
extern crate bao;
extern crate docopt;
extern crate failure;
extern crate hex;
extern crate memmap;
#[macro_use]
extern crate serde_derive;

use failure::{err_msg, Error};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "
Usage: bao hash [<inputs>...]
       bao encode <input> (<output> | --outboard=<file>)
       bao decode <hash> [<input>] [<output>] [--outboard=<file>]
       bao slice <start> <count> [<input>] [<output>] [--outboard=<file>]
       bao decode-slice <hash> <start> <count> [<input>] [<output>]
       bao (--help | --version)
";

#[derive(Debug, Deserialize)]
struct Args {
    cmd_decode: bool,
    cmd_encode: bool,
    cmd_hash: bool,
    cmd_slice: bool,
    cmd_decode_slice: bool,
    arg_inputs: Vec<PathBuf>,
    arg_input: Option<PathBuf>,
    arg_output: Option<PathBuf>,
    arg_hash: String,
    arg_start: u64,
    arg_count: u64,
    flag_help: bool,
    flag_outboard: Option<PathBuf>,
    flag_version: bool,
}

fn main() -> Result<(), Error> {
    let args: Args = docopt::Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    if args.flag_help {
        print!("{}", USAGE);
    } else if args.flag_version {
        println!("{}", VERSION);
    } else if args.cmd_hash {
        hash(&args)?;
    } else if args.cmd_encode {
        encode(&args)?;
    } else if args.cmd_decode {
        decode(&args)?;
    } else if args.cmd_slice {
        slice(&args)?;
    } else if args.cmd_decode_slice {
        decode_slice(&args)?;
    } else {
        unreachable!();
    }

    Ok(())
}

fn hash_one(mut input: Input) -> Result<bao::hash::Hash, Error> {
    if let Input::File(ref file) = input {
        if let Some(map) = maybe_memmap_input(file)? {
            return Ok(bao::hash::hash(&map));
        }
    }
    let mut writer = bao::hash::Writer::new();
    io::copy(&mut input, &mut writer)?;
    Ok(writer.finish())
}

fn hash(args: &Args) -> Result<(), Error> {
    if args.arg_inputs.len() > 1 {
        for name in &args.arg_inputs {
            let input = open_input(&Some(name.clone()))?;
            let hash = hash_one(input)?;
            println!("{}  {}", hex::encode(hash), name.to_string_lossy());
        }
    } else {
        let input = open_input(&args.arg_inputs.first().cloned())?;
        let hash = hash_one(input)?;
        println!("{}", hex::encode(hash));
    }
    Ok(())
}

fn encode(args: &Args) -> Result<(), Error> {
    let mut input = open_input(&args.arg_input)?;
    let out_maybe_path = if args.flag_outboard.is_some() {
        &args.flag_outboard
    } else {
        &args.arg_output
    };
    let mut output = open_output(out_maybe_path)?;
    // The encoder buffers the whole input. Map it when we can, otherwise
    // slurp it into memory.
    if let Input::File(ref file) = input {
        if let Some(map) = maybe_memmap_input(file)? {
            let (encoded, _) = if args.flag_outboard.is_some() {
                bao::encode::encode_outboard(&map)
            } else {
                bao::encode::encode(&map)
            };
            output.write_all(&encoded)?;
            return Ok(());
        }
    }
    let mut buf = Vec::new();
    input.read_to_end(&mut buf)?;
    let (encoded, _) = if args.flag_outboard.is_some() {
        bao::encode::encode_outboard(&buf)
    } else {
        bao::encode::encode(&buf)
    };
    output.write_all(&encoded)?;
    Ok(())
}

fn decode(args: &Args) -> Result<(), Error> {
    let input = open_input(&args.arg_input)?;
    let output = open_output(&args.arg_output)?;
    let hash = parse_hash(args)?;
    let result = if args.flag_outboard.is_some() {
        let outboard = open_input(&args.flag_outboard)?;
        bao::decode::decode_outboard(input, outboard, output, &hash)
    } else {
        bao::decode::decode(input, output, &hash)
    };
    allow_broken_pipe(result)?;
    Ok(())
}

fn slice(args: &Args) -> Result<(), Error> {
    let input = open_input(&args.arg_input)?;
    let output = open_output(&args.arg_output)?;
    // Slice extraction seeks past the parts of the encoding it doesn't
    // need, so the inputs have to be real files.
    let in_file = require_file(input, "slicing input")?;
    if args.flag_outboard.is_some() {
        let outboard = open_input(&args.flag_outboard)?;
        let outboard_file = require_file(outboard, "slicing outboard input")?;
        bao::decode::slice_outboard(in_file, outboard_file, output, args.arg_start, args.arg_count)?;
    } else {
        bao::decode::slice(in_file, output, args.arg_start, args.arg_count)?;
    }
    Ok(())
}

fn decode_slice(args: &Args) -> Result<(), Error> {
    let input = open_input(&args.arg_input)?;
    let output = open_output(&args.arg_output)?;
    let hash = parse_hash(args)?;
    allow_broken_pipe(bao::decode::decode_slice(
        input,
        output,
        &hash,
        args.arg_start,
        args.arg_count,
    ))?;
    Ok(())
}

enum Input {
    Stdin(io::Stdin),
    File(File),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Input::Stdin(ref mut stdin) => stdin.read(buf),
            Input::File(ref mut file) => file.read(buf),
        }
    }
}

enum Output {
    Stdout(io::Stdout),
    File(File),
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Output::Stdout(ref mut stdout) => stdout.write(buf),
            Output::File(ref mut file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Output::Stdout(ref mut stdout) => stdout.flush(),
            Output::File(ref mut file) => file.flush(),
        }
    }
}

fn open_input(maybe_path: &Option<PathBuf>) -> Result<Input, Error> {
    Ok(if let Some(ref path) = *maybe_path {
        if path == Path::new("-") {
            Input::Stdin(io::stdin())
        } else {
            Input::File(File::open(path)?)
        }
    } else {
        Input::Stdin(io::stdin())
    })
}

fn open_output(maybe_path: &Option<PathBuf>) -> Result<Output, Error> {
    Ok(if let Some(ref path) = *maybe_path {
        if path == Path::new("-") {
            Output::Stdout(io::stdout())
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            Output::File(file)
        }
    } else {
        Output::Stdout(io::stdout())
    })
}

fn maybe_memmap_input(in_file: &File) -> Result<Option<memmap::Mmap>, Error> {
    let metadata = in_file.metadata()?;
    Ok(if !metadata.is_file() {
        // Not a real file.
        None
    } else if metadata.len() > isize::max_value() as u64 {
        // Too big to map safely; stream it instead.
        // https://github.com/danburkert/memmap-rs/issues/69
        None
    } else if metadata.len() == 0 {
        // Mapping an empty file returns an error.
        None
    } else {
        let map = unsafe { memmap::Mmap::map(in_file)? };
        Some(map)
    })
}

fn require_file(input: Input, name: &str) -> Result<File, Error> {
    match input {
        Input::File(file) => {
            if file.metadata()?.is_file() {
                Ok(file)
            } else {
                Err(err_msg(format!("{} must be a real file", name)))
            }
        }
        Input::Stdin(_) => Err(err_msg(format!("{} must be a real file", name))),
    }
}

fn parse_hash(args: &Args) -> Result<bao::hash::Hash, Error> {
    let hash_vec = hex::decode(&args.arg_hash).map_err(|_| err_msg("invalid hex"))?;
    if hash_vec.len() != bao::hash::HASH_SIZE {
        return Err(err_msg("wrong length hash"));
    };
    Ok(*array_ref!(hash_vec, 0, bao::hash::HASH_SIZE))
}

// Decoded output often gets piped into something like `head -c 100`, which
// closes the pipe as soon as it has read enough. Treat that as success for
// the decoding commands. Encoding keeps the error, because a truncated
// encoding is useless.
fn allow_broken_pipe<T>(result: io::Result<T>) -> io::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.kind() == io::ErrorKind::BrokenPipe {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}
