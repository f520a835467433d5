use filebuffer::FileBuffer;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;
use transflate::{brotli_decode, brotli_encode, zlib_decode, zlib_encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zlib,
    Brotli,
}

impl FromStr for Format {
    type Err = String;
    fn from_str(s: &str) -> Result<Format, String> {
        match s {
            "zlib" | "deflate" | "zz" => Ok(Format::Zlib),
            "brotli" | "br" => Ok(Format::Brotli),
            other => Err(format!("unknown format: {}", other)),
        }
    }
}

impl Format {
    fn extension(self) -> &'static str {
        match self {
            Format::Zlib => "zz",
            Format::Brotli => "br",
        }
    }
}

#[derive(StructOpt)]
struct TransflateParams {
    input: PathBuf,
    output: Option<PathBuf>,
    #[structopt(long, default_value = "zlib")]
    from: Format,
    #[structopt(long, default_value = "brotli")]
    to: Format,
    /// Decode only; report the plain size and write nothing.
    #[structopt(short)]
    simulate: bool,
}

fn main() {
    env_logger::init();
    let params: TransflateParams = TransflateParams::from_args();

    let input = FileBuffer::open(&params.input).unwrap();
    let plain = match params.from {
        Format::Zlib => zlib_decode(&input),
        Format::Brotli => brotli_decode(&input),
    }
    .unwrap();

    if params.simulate {
        eprintln!("{}: {} plain bytes", params.input.display(), plain.len());
        return;
    }

    let transcoded = match params.to {
        Format::Zlib => zlib_encode(&plain),
        Format::Brotli => brotli_encode(&plain),
    }
    .unwrap();

    let mut write_file = BufWriter::new(
        File::create(
            params
                .output
                .unwrap_or_else(|| params.input.with_extension(params.to.extension())),
        )
        .unwrap(),
    );
    write_file.write_all(&transcoded).unwrap();
}
