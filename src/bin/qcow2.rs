//! qcow2 command-line tool
//!
//! Dumps image headers and converts images, flattening backing chains

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qcow2_rs::{convert, Header, ImageReader, WriterConfig, HEADER_LENGTH};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "qcow2", version)]
#[command(about = "Inspect and convert QCOW2 disk images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every header field of an image
    Info {
        /// Image to inspect
        image: PathBuf,
    },

    /// Copy an image and its backing chain into a new standalone image
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Store clusters DEFLATE-compressed
        #[arg(short, long)]
        compressed: bool,

        /// log2 of the output cluster size [default: 16, or from --config]
        #[arg(short = 'b', long)]
        cluster_bits: Option<u32>,

        /// TOML writer configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn info_command(image: PathBuf) -> Result<()> {
    let mut raw = Vec::with_capacity(HEADER_LENGTH);
    File::open(&image)
        .with_context(|| format!("opening {:?}", image))?
        .take(HEADER_LENGTH as u64)
        .read_to_end(&mut raw)?;
    let header = Header::decode(&raw).with_context(|| format!("decoding {:?}", image))?;

    let fields: [(&str, u64); 18] = [
        ("magic", header.magic.into()),
        ("version", header.version.into()),
        ("backing_file_offset", header.backing_file_offset),
        ("backing_file_size", header.backing_file_size.into()),
        ("cluster_bits", header.cluster_bits.into()),
        ("size", header.size),
        ("crypt_method", header.crypt_method.into()),
        ("l1_size", header.l1_size.into()),
        ("l1_table_offset", header.l1_table_offset),
        ("refcount_table_offset", header.refcount_table_offset),
        ("refcount_table_clusters", header.refcount_table_clusters.into()),
        ("nb_snapshots", header.nb_snapshots.into()),
        ("snapshots_offset", header.snapshots_offset),
        ("incompatible_features", header.incompatible_features),
        ("compatible_features", header.compatible_features),
        ("autoclear_features", header.autoclear_features),
        ("refcount_order", header.refcount_order.into()),
        ("header_length", header.header_length.into()),
    ];
    for (name, value) in fields {
        println!("{:>25}: {:x}", name, value);
    }

    if header.has_backing_file() {
        let reader = ImageReader::open(&image)?;
        if let Some(backing) = reader.backing_file() {
            println!("{:>25}: {}", "backing_file", backing.display());
        }
    }
    Ok(())
}

fn convert_command(
    input: PathBuf,
    output: PathBuf,
    compressed: bool,
    cluster_bits: Option<u32>,
    config: Option<PathBuf>,
) -> Result<()> {
    let mut writer_config = match &config {
        Some(path) => {
            WriterConfig::load(path).with_context(|| format!("loading config {:?}", path))?
        }
        None => WriterConfig::default(),
    };
    if let Some(bits) = cluster_bits {
        writer_config = writer_config.cluster_bits(bits);
    }
    if compressed {
        writer_config = writer_config.compressed();
    }

    info!(
        "Converting {:?} -> {:?} (cluster_bits={}, mode={:?})",
        input, output, writer_config.cluster_bits, writer_config.mode
    );
    let summary = convert(&input, &output, &writer_config)?;
    println!(
        "{}: {} of {} clusters written, {} bytes",
        output.display(),
        summary.clusters_written,
        summary.clusters,
        summary.output_bytes
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Info { image } => info_command(image),
        Command::Convert {
            input,
            output,
            compressed,
            cluster_bits,
            config,
        } => convert_command(input, output, compressed, cluster_bits, config),
    }
}
