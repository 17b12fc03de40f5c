use clap::{Parser, Subcommand};
use log::info;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use capture_webm::ivf::IvfReader;
use capture_webm::reader::{self, element_name, Element, SimpleBlockHeader};
use capture_webm::webm::*;
use capture_webm::{CaptureConfig, Quality, WebmMuxer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mux encoded screen capture frames into WebM")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remux VP8 packets from an IVF file into a seekable WebM file
    Mux {
        /// IVF file produced by the encoder
        #[arg(short, long)]
        input: PathBuf,

        /// Output WebM file
        #[arg(short, long)]
        output: PathBuf,

        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Encoder preset (overrides config file)
        #[arg(short, long, value_enum)]
        quality: Option<Quality>,
    },
    /// Print the element tree of a WebM file
    Inspect {
        /// WebM file to inspect
        file: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Mux {
            input,
            output,
            config,
            quality,
        } => mux(input, output, config, quality),
        Command::Inspect { file } => inspect(file),
    }
}

fn mux(
    input: PathBuf,
    output: PathBuf,
    config_path: Option<PathBuf>,
    quality: Option<Quality>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &config_path {
        Some(path) => CaptureConfig::load(path)?,
        None => CaptureConfig::default(),
    };
    if let Some(quality) = quality {
        config.quality = quality;
    }

    let input_file = File::open(&input)
        .map_err(|e| format!("Failed to open input file '{}': {}", input.display(), e))?;
    let mut frames = IvfReader::new(BufReader::new(input_file))?;
    let header = *frames.header();

    let config = config.with_default_dimensions(header.width as u32, header.height as u32);
    let track = config.video_track(header.timebase)?;
    info!(
        "Muxing {} ({}x{}, preset {:?}: deadline {} us, cpu-used {})",
        input.display(),
        track.width,
        track.height,
        config.quality,
        config.quality.deadline_us(),
        config.quality.cpu_used()
    );

    let output_file = File::create(&output)
        .map_err(|e| format!("Failed to create output file '{}': {}", output.display(), e))?;
    let mut muxer = WebmMuxer::open(BufWriter::new(output_file), track)?;

    let read_error = frames.submit_all(&mut muxer)?;

    let (_, stats) = muxer.finalize()?;
    println!(
        "Wrote {}: {} frames, {} clusters, {} cues, {:.3}s, {} bytes",
        output.display(),
        stats.frames,
        stats.clusters,
        stats.cues,
        stats.duration_ms / 1000.0,
        stats.bytes_written
    );
    if let Some(e) = read_error {
        println!("  input ended early ({}); kept the frames read before it", e);
    }
    if stats.clamped_timestamps > 0 {
        println!(
            "  {} timestamps were adjusted to keep playback order",
            stats.clamped_timestamps
        );
    }
    Ok(())
}

fn inspect(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(&file)
        .map_err(|e| format!("Failed to read file '{}': {}", file.display(), e))?;
    let elements = reader::parse_elements(&data)?;

    for element in &elements {
        print_element(&data, element, 0)?;
    }

    let Some(segment) = elements.iter().find(|e| e.id == SEGMENT_ID) else {
        return Err("No Segment element found".into());
    };

    let mut blocks = 0u64;
    let mut keyframes = 0u64;
    for cluster in segment.find_all(CLUSTER_ID) {
        for block in cluster.find_all(SIMPLE_BLOCK_ID) {
            let header = SimpleBlockHeader::parse(block.payload(&data))?;
            blocks += 1;
            if header.keyframe {
                keyframes += 1;
            }
        }
    }
    let cues = segment
        .find(CUES_ID)
        .map_or(0, |cues| cues.find_all(CUE_POINT_ID).count());

    println!();
    println!("Clusters:  {}", segment.find_all(CLUSTER_ID).count());
    println!("Blocks:    {} ({} keyframes)", blocks, keyframes);
    println!("Cues:      {}", cues);
    if let Some(duration) = segment
        .find(INFO_ID)
        .and_then(|info| info.find(DURATION_ID))
    {
        println!("Duration:  {:.1} ms", reader::read_float(duration.payload(&data))?);
    }
    if let Some(uid) = segment
        .find(TRACKS_ID)
        .and_then(|tracks| tracks.find(TRACK_ENTRY_ID))
        .and_then(|entry| entry.find(TRACK_UID_ID))
    {
        println!("Track UID: 0x{:08X}", reader::read_uint(uid.payload(&data))?);
    }
    Ok(())
}

fn print_element(
    data: &[u8],
    element: &Element,
    depth: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let indent = "  ".repeat(depth);
    let name = element_name(element.id);
    let payload = element.payload(data);

    let value = match element.id {
        DOC_TYPE_ID | CODEC_ID_ID | MUXING_APP_ID | WRITING_APP_ID => {
            format!(" \"{}\"", String::from_utf8_lossy(payload))
        }
        DURATION_ID => format!(" {:.3}", reader::read_float(payload)?),
        SIMPLE_BLOCK_ID => {
            let header = SimpleBlockHeader::parse(payload)?;
            format!(
                " track={} tc={:+}{}{}",
                header.track_number,
                header.relative_timecode,
                if header.keyframe { " key" } else { "" },
                if header.invisible { " invisible" } else { "" }
            )
        }
        SEEK_ID_ID => format!(" 0x{:X}", reader::read_uint(payload)?),
        _ if element.children.is_empty() && payload.len() <= 8 => {
            format!(" {}", reader::read_uint(payload)?)
        }
        _ => String::new(),
    };

    println!(
        "{}{} @{} size={}{}",
        indent, name, element.offset, element.size, value
    );
    for child in &element.children {
        print_element(data, child, depth + 1)?;
    }
    Ok(())
}
