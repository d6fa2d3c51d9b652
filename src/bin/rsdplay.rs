//! rsdplay: play a WAV file or raw PCM through an rsd server

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rsound::{
    client::RsdStream,
    config::AppConfig,
    constants::{HEADER_SIZE, MAX_CHUNK_SIZE},
    protocol::{decode_stream_header, SampleFormat, StreamDescriptor},
};

const BLOCK_SIZE: usize = 4096;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(20);

const WAV_PCM: u16 = 1;
const WAV_ALAW: u16 = 6;
const WAV_MULAW: u16 = 7;

#[derive(Parser, Debug)]
#[command(version)]
/// Play a WAV file or raw PCM through an rsd server
///
/// Reads standard input when no file is given or the file is `-`.
struct Args {
    /// Input file, or `-` for standard input
    #[arg(default_value = "-")]
    input: String,

    /// Server host
    #[arg(long = "host", short = 's')]
    host: Option<String>,

    /// Server port
    #[arg(long = "port", short = 'p')]
    port: Option<u16>,

    /// Input has no WAV header
    #[arg(long = "raw")]
    raw: bool,

    /// Sample rate for raw input
    #[arg(long = "rate", short = 'r', default_value_t = 44100)]
    rate: u32,

    /// Channel count for raw input
    #[arg(long = "channels", short = 'c', default_value_t = 2)]
    channels: u16,

    /// Sample format for raw input, e.g. S16LE or mulaw
    #[arg(long = "format", short = 'f', default_value = "S16LE")]
    format: SampleFormat,

    /// Name shown by the server
    #[arg(long = "identity", short = 'i')]
    identity: Option<String>,
}

/// Describe a WAV file from its canonical 44-byte header.
///
/// Real files keep the data size where the stream header carries its
/// format tag, so the tag is rebuilt from the WAV fields before decoding.
fn describe_wav(header: &mut [u8; HEADER_SIZE]) -> Result<StreamDescriptor> {
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        bail!("not a WAV file");
    }

    let audio_format = u16::from_le_bytes([header[20], header[21]]);
    let bits = u16::from_le_bytes([header[34], header[35]]);
    let tag = match (audio_format, bits) {
        (WAV_ALAW, _) => SampleFormat::Alaw.tag(),
        (WAV_MULAW, _) => SampleFormat::Mulaw.tag(),
        (WAV_PCM, 32) => SampleFormat::S32Le.tag(),
        // 8 and 16 bits are inferred by the decoder.
        (WAV_PCM, _) => 0,
        (other, _) => bail!("unsupported WAV audio format {}", other),
    };
    header[42..44].copy_from_slice(&tag.to_le_bytes());

    decode_stream_header(header).context("invalid WAV header")
}

fn open_input(path: &str) -> Result<Box<dyn Read>> {
    if path == "-" {
        Ok(Box::new(io::stdin().lock()))
    } else {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Fill `buf` as far as the input allows; short only at end of input.
fn read_block(input: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let path = args.input.clone();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut input = open_input(&path)?;

    let desc = if args.raw {
        StreamDescriptor::new(args.channels, args.rate, args.format)
    } else {
        let mut header = [0u8; HEADER_SIZE];
        input
            .read_exact(&mut header)
            .context("Failed to read WAV header")?;
        describe_wav(&mut header)?
    };
    desc.validate().context("Invalid stream format")?;

    let mut config = AppConfig::load(None).context("Failed to load configuration")?;
    config.client.apply_env();

    let mut stream = RsdStream::with_config(&config.client);
    if let Some(host) = &args.host {
        stream.set_host(host);
    }
    if let Some(port) = args.port {
        stream.set_port(port);
    }
    if let Some(identity) = &args.identity {
        stream.set_identity(identity);
    }
    stream.set_channels(desc.channels);
    stream.set_rate(desc.sample_rate);
    stream.set_format(desc.format);

    tracing::info!("Playing {} ({})", path, desc);
    stream.start().context("Failed to connect to server")?;

    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = read_block(&mut *input, &mut block).context("Failed to read input")?;
        if n == 0 {
            break;
        }
        stream.write(&block[..n]).context("Stream ended")?;
        stream.delay_wait();
    }

    // Let the transmit thread send every whole chunk before hanging up.
    let chunk_size = stream
        .backend_info()
        .map(|info| info.chunk_size.min(MAX_CHUNK_SIZE) as usize)
        .unwrap_or(1);
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while stream.is_ready() && stream.pointer() >= chunk_size && Instant::now() < deadline {
        thread::sleep(DRAIN_POLL);
    }

    stream.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsound::protocol::encode_stream_header;

    fn wav_header(audio_format: u16, bits: u16, data_len: u32) -> [u8; HEADER_SIZE] {
        let desc = StreamDescriptor::new(2, 22050, SampleFormat::S16Le);
        let mut header = encode_stream_header(&desc);
        header[20..22].copy_from_slice(&audio_format.to_le_bytes());
        header[34..36].copy_from_slice(&bits.to_le_bytes());
        header[40..44].copy_from_slice(&data_len.to_le_bytes());
        header
    }

    #[test]
    fn test_describe_wav_ignores_data_size() {
        // Upper half of the data size is 0x0012, not a format tag.
        let mut header = wav_header(WAV_PCM, 16, 0x0012_3400);
        let desc = describe_wav(&mut header).unwrap();
        assert_eq!(desc, StreamDescriptor::new(2, 22050, SampleFormat::S16Le));
    }

    #[test]
    fn test_describe_wav_companded() {
        let mut header = wav_header(WAV_MULAW, 8, 1000);
        assert_eq!(describe_wav(&mut header).unwrap().format, SampleFormat::Mulaw);

        let mut header = wav_header(WAV_PCM, 8, 1000);
        assert_eq!(describe_wav(&mut header).unwrap().format, SampleFormat::U8);
    }

    #[test]
    fn test_raw_flags() {
        let args = Args::try_parse_from([
            "rsdplay", "--raw", "-r", "8000", "-c", "1", "-f", "mulaw", "-s", "box", "in.pcm",
        ])
        .unwrap();
        assert!(args.raw);
        assert_eq!(args.rate, 8000);
        assert_eq!(args.channels, 1);
        assert_eq!(args.format, SampleFormat::Mulaw);
        assert_eq!(args.host.as_deref(), Some("box"));
        assert_eq!(args.input, "in.pcm");
    }

    #[test]
    fn test_defaults_read_stdin() {
        let args = Args::try_parse_from(["rsdplay"]).unwrap();
        assert_eq!(args.input, "-");
        assert!(!args.raw);
        assert_eq!(args.format, SampleFormat::S16Le);
        assert_eq!((args.rate, args.channels), (44100, 2));

        assert!(Args::try_parse_from(["rsdplay", "-f", "S24LE"]).is_err());
    }

    #[test]
    fn test_describe_wav_rejects_other_files() {
        let mut header = wav_header(WAV_PCM, 16, 0);
        header[0..4].copy_from_slice(b"OggS");
        assert!(describe_wav(&mut header).is_err());

        let mut header = wav_header(3, 32, 0);
        assert!(describe_wav(&mut header).is_err());
    }
}
