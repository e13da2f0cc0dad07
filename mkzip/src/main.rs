use std::fs::File;
use std::io::{self, BufWriter};

use anyhow::*;
use camino::Utf8PathBuf;
use log::*;
use structopt::*;

use zipfly::names::deduplicate;
use zipfly::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "mkzip", about = "Streams files into a Zip64 archive")]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Write the archive here instead of stdout
    #[structopt(short, long)]
    output: Option<Utf8PathBuf>,

    /// Deflate files instead of storing them
    #[structopt(short, long)]
    deflate: bool,

    /// Read files this many bytes at a time
    #[structopt(long, default_value = "4096")]
    chunk_size: usize,

    /// Print the archive's size without writing it
    /// (only a guess with --deflate; incompressible files can make it bigger)
    #[structopt(short = "n", long)]
    dry_run: bool,

    /// Read files with Tokio instead of blocking reads
    #[structopt(long = "async")]
    use_async: bool,

    #[structopt(name("files"), required = true)]
    files: Vec<Utf8PathBuf>,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    let mut entries = build_entries(&args)?;
    deduplicate(&mut entries);

    if args.dry_run {
        let size = archive_size(&entries).context("Couldn't compute archive size")?;
        println!("{}", size);
        return Ok(());
    }

    let written = if args.use_async {
        write_async(entries, args.output.as_ref())?
    } else {
        write_blocking(entries, args.output.as_ref())?
    };
    info!("Wrote {} bytes", written);
    Ok(())
}

fn build_entries(args: &Opt) -> Result<Vec<FileEntry>> {
    let method = if args.deflate {
        CompressionMethod::Deflate
    } else {
        CompressionMethod::None
    };

    let mut entries = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let metadata = path
            .metadata()
            .with_context(|| format!("Couldn't stat {}", path))?;
        ensure!(metadata.is_file(), "{} isn't a regular file", path);

        // Absolute paths make for unfriendly archives.
        let name = path.as_str().trim_start_matches('/');
        debug!("Adding {} as {}", path, name);
        entries.push(
            LocalFile::new(path.clone())
                .with_name(name)
                .with_compression(method)
                .with_chunk_size(args.chunk_size)
                .into(),
        );
    }
    Ok(entries)
}

fn write_blocking(entries: Vec<FileEntry>, output: Option<&Utf8PathBuf>) -> Result<u64> {
    let stream = ZipStream::new(entries);
    let written = match output {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("Couldn't create {}", path))?;
            stream.write_to(BufWriter::new(file))
        }
        None => stream.write_to(BufWriter::new(io::stdout().lock())),
    };
    written.context("Couldn't write archive")
}

fn write_async(entries: Vec<FileEntry>, output: Option<&Utf8PathBuf>) -> Result<u64> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .context("Couldn't start Tokio runtime")?;

    runtime.block_on(async {
        let stream = AsyncZipStream::new(entries);
        let written = match output {
            Some(path) => {
                let file = tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("Couldn't create {}", path))?;
                stream.write_to(tokio::io::BufWriter::new(file)).await
            }
            None => stream.write_to(tokio::io::stdout()).await,
        };
        written.context("Couldn't write archive")
    })
}
