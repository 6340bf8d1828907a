use anyhow::{bail, Context, Result};
use base64::Engine;
use chrono::{Local, TimeZone};
use clap::{arg, value_parser, ArgMatches, Command};
use colorize::AnsiColor;
use drofs::{
    builder::{DirEntryBuilder, FileEntryBuilder, ImageBuilder, NodeBuilder},
    verify_original, Entry, EntryType, Image, MetadataTag,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use memmap2::Mmap;
use serde::Serialize;
use std::{
    fs::File,
    io::{stdout, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

const DEFAULT_LEVEL: u8 = 6;

fn cli() -> Command {
    Command::new("drofs-tools")
        .about("Tools for creating and reading DROFS images")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(arg!(-v --verbose "Log decoding steps").global(true))
        .subcommand(
            Command::new("pack")
                .about("Pack a directory into a DROFS image")
                .arg(arg!(source: <SOURCE>))
                .arg(arg!(-o --out [OUT]))
                .arg(
                    arg!(-l --level [LEVEL] "zlib level, 0 stores files uncompressed")
                        .value_parser(value_parser!(u8).range(0..=10)),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Check the image checksum and every entry in it")
                .arg(arg!(image_path: <IMAGE>)),
        )
        .subcommand(
            Command::new("compare")
                .about("Compare a DROFS image against a source directory")
                .arg(arg!(image_path: <IMAGE>))
                .arg(arg!(source: <SOURCE>)),
        )
        .subcommand(
            Command::new("list")
                .about("List every path in a DROFS image")
                .arg(arg!(image_path: <IMAGE>))
                .arg(arg!(-j --json))
                .arg(arg!(-p --pretty)),
        )
        .subcommand(
            Command::new("tree")
                .about("Display a file tree of a DROFS image")
                .arg(arg!(image_path: <IMAGE>)),
        )
        .subcommand(
            Command::new("info")
                .about("Get info about an entry in a DROFS image")
                .arg(arg!(image_path: <IMAGE>))
                .arg(arg!(path: <PATH>))
                .arg(arg!(-j --json))
                .arg(arg!(-p --pretty)),
        )
        .subcommand(
            Command::new("read")
                .about("Write the original contents of a file to stdout")
                .arg(arg!(image_path: <IMAGE>))
                .arg(arg!(path: <PATH>)),
        )
        .subcommand(
            Command::new("unpack")
                .about("Unpack a DROFS image into a directory")
                .arg(arg!(image_path: <IMAGE>))
                .arg(arg!(-o --out [OUT])),
        )
}

pub fn main() -> Result<()> {
    let matches = cli().get_matches();
    let level = if matches.get_flag("verbose") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match matches.subcommand() {
        Some(("pack", sub_matches)) => pack(sub_matches),
        Some(("verify", sub_matches)) => {
            let mmap = map_image(sub_matches)?;
            let (checked, failures) = verify_image(&mmap)?;
            if failures.is_empty() {
                println!("{} ({checked} entries)", "OK".green().bold());
                Ok(())
            } else {
                for (path, err) in &failures {
                    println!("{} {path}: {err}", "FAIL".red().bold());
                }
                bail!("{} of {checked} entries failed verification", failures.len())
            }
        }
        Some(("compare", sub_matches)) => {
            let mmap = map_image(sub_matches)?;
            let image = Image::mount(&mmap)?;
            let source = sub_matches
                .get_one::<String>("source")
                .context("Couldn't get source from args")?;
            let mismatches = compare(&image, Path::new(source))?;
            if mismatches.is_empty() {
                println!("{}", "OK".green().bold());
                Ok(())
            } else {
                for mismatch in &mismatches {
                    println!("{} {mismatch}", "MISMATCH".red().bold());
                }
                bail!("{} differences found", mismatches.len())
            }
        }
        Some(("list", sub_matches)) => {
            let mmap = map_image(sub_matches)?;
            let image = Image::mount(&mmap)?;
            let paths = list_paths(&image)?;
            if sub_matches.get_flag("json") {
                if sub_matches.get_flag("pretty") {
                    serde_json::to_writer_pretty(stdout().lock(), &paths)?;
                } else {
                    serde_json::to_writer(stdout().lock(), &paths)?;
                }
                println!();
            } else {
                for path in paths {
                    println!("{path}");
                }
            }
            Ok(())
        }
        Some(("tree", sub_matches)) => {
            let mmap = map_image(sub_matches)?;
            let image = Image::mount(&mmap)?;
            let root = image.root()?;
            let mut root_name = String::from_utf8_lossy(root.name()).to_string();
            if root_name.is_empty() {
                root_name.push('/');
            }
            println!("{}", root_name.blue().bold());
            print_tree(&image, &root, &mut Vec::new())
        }
        Some(("info", sub_matches)) => {
            let mmap = map_image(sub_matches)?;
            let image = Image::mount(&mmap)?;
            let path = sub_matches
                .get_one::<String>("path")
                .context("Couldn't get path from args")?;
            let entry = image.resolve(path)?;
            let info = EntryInfo::new(&entry);
            if sub_matches.get_flag("json") {
                if sub_matches.get_flag("pretty") {
                    serde_json::to_writer_pretty(stdout().lock(), &info)?;
                } else {
                    serde_json::to_writer(stdout().lock(), &info)?;
                }
            } else {
                serde_yaml::to_writer(stdout().lock(), &info)?;
            }
            println!();
            Ok(())
        }
        Some(("read", sub_matches)) => {
            let mmap = map_image(sub_matches)?;
            let image = Image::mount(&mmap)?;
            let path = sub_matches
                .get_one::<String>("path")
                .context("Couldn't get path from args")?;
            let mut reader = image.open(path)?;
            std::io::copy(&mut reader, &mut stdout().lock()).context("Couldn't copy into stdout")?;
            Ok(())
        }
        Some(("unpack", sub_matches)) => {
            let mmap = map_image(sub_matches)?;
            let image = Image::mount(&mmap)?;
            let out = match sub_matches.get_one::<String>("out") {
                Some(out) => PathBuf::from(out),
                None => {
                    let root = image.root()?;
                    match root.name_str().filter(|n| !n.is_empty()) {
                        Some(name) => PathBuf::from(name),
                        None => default_unpack_dir(sub_matches)?,
                    }
                }
            };
            std::fs::create_dir_all(&out).context("Couldn't create directory")?;
            unpack(&image, &out)
        }
        _ => unreachable!(),
    }
}

fn map_image(sub_matches: &ArgMatches) -> Result<Mmap> {
    let image_path = sub_matches
        .get_one::<String>("image_path")
        .context("Couldn't get image path from args")?;
    let file = File::open(image_path).with_context(|| format!("Couldn't open {image_path}"))?;
    // The image is treated as immutable for as long as it is mapped.
    let mmap = unsafe { Mmap::map(&file) }.context("Couldn't map image")?;
    Ok(mmap)
}

fn default_unpack_dir(sub_matches: &ArgMatches) -> Result<PathBuf> {
    let image_path = PathBuf::from(
        sub_matches
            .get_one::<String>("image_path")
            .context("Couldn't get image path from args")?,
    );
    let stem = image_path
        .file_stem()
        .context("Couldn't establish an extraction point")?;
    Ok(PathBuf::from(stem))
}

fn pack(sub_matches: &ArgMatches) -> Result<()> {
    let source = PathBuf::from(
        sub_matches
            .get_one::<String>("source")
            .context("Couldn't get source from args")?,
    );
    let source = std::fs::canonicalize(&source).context("Couldn't canonicalize source path")?;
    let root_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let out = match sub_matches.get_one::<String>("out") {
        Some(out) => PathBuf::from(out),
        None => PathBuf::from(format!("{root_name}.drofs")),
    };
    let level = sub_matches
        .get_one::<u8>("level")
        .copied()
        .unwrap_or(DEFAULT_LEVEL);

    let multi_progress = MultiProgress::new();
    let len_spinner = multi_progress.add(ProgressBar::new_spinner());
    let mut len = 0;
    let mut entry_count = 0;
    for metadata in walkdir::WalkDir::new(&source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            len_spinner.inc(1);
            e.metadata().ok()
        })
    {
        len += metadata.len();
        entry_count += 1;
    }
    len_spinner.finish();
    let entry_progress_bar = multi_progress.add(ProgressBar::new(entry_count));
    let data_progress_bar = multi_progress.add(ProgressBar::new(len).with_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{eta}] {wide_bar} {bytes}/{total_bytes} ({percent_precise}%)",
        )?,
    ));

    let root = pack_folder(
        &source,
        root_name,
        level,
        &entry_progress_bar,
        &data_progress_bar,
    )?;
    let written = ImageBuilder::new(root)
        .write_to(File::create(&out).context("Couldn't create output file")?)
        .context("Couldn't write image")?;
    entry_progress_bar.finish();
    data_progress_bar.finish();
    println!("{} {} ({written} bytes)", "Packed".green().bold(), out.display());
    Ok(())
}

fn pack_folder(
    dir_path: &Path,
    name: String,
    level: u8,
    entry_progress_bar: &ProgressBar,
    data_progress_bar: &ProgressBar,
) -> Result<DirEntryBuilder> {
    let mut dir = DirEntryBuilder::new(name);
    if let Some(timestamp) = unix_time(std::fs::metadata(dir_path)?.created().ok()) {
        dir = dir.timestamp(timestamp);
    }

    let mut children: Vec<_> = std::fs::read_dir(dir_path)
        .with_context(|| format!("Couldn't read dir {}", dir_path.display()))?
        .filter_map(|e| e.ok())
        .collect();
    children.sort_by_key(|e| e.file_name());

    for file in children {
        let Ok(file_type) = file.file_type() else {
            continue;
        };
        let filename = file.file_name().to_string_lossy().to_string();
        entry_progress_bar.inc(1);
        entry_progress_bar.println(file.path().to_string_lossy());
        if file_type.is_dir() {
            let child = pack_folder(
                &file.path(),
                filename,
                level,
                entry_progress_bar,
                data_progress_bar,
            )?;
            dir.push(NodeBuilder::Dir(child));
        } else if file_type.is_file() {
            let data = std::fs::read(file.path())
                .with_context(|| format!("Couldn't read file {}", file.path().display()))?;
            data_progress_bar.inc(data.len() as u64);
            let mut entry = FileEntryBuilder::new(filename, data).compress(level);
            if let Some(timestamp) = unix_time(file.metadata()?.modified().ok()) {
                entry = entry.timestamp(timestamp);
            }
            dir.push(NodeBuilder::File(entry));
        } else {
            log::warn!("Skipping unknown item: {}", file.path().display());
        }
    }
    Ok(dir)
}

fn unix_time(time: Option<SystemTime>) -> Option<u32> {
    let secs = time?.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    u32::try_from(secs).ok()
}

/// Returns the number of entries checked and the ones that failed.
fn verify_image(bytes: &[u8]) -> Result<(usize, Vec<(String, drofs::Error)>)> {
    let image = Image::new(bytes)?;
    image.verify().context("Image header check failed")?;

    let mut checked = 1;
    let mut failures = Vec::new();
    if let Err(e) = image.root()?.verify() {
        failures.push(("/".to_string(), e));
    }
    for walked in image.walk("/")? {
        let walked = walked?;
        checked += 1;
        if let Err(e) = walked.entry.verify() {
            failures.push((walked.path, e));
            continue;
        }
        if walked.entry.is_file() {
            if let Err(e) = verify_original(&walked.entry) {
                failures.push((walked.path, e));
            }
        }
    }
    Ok((checked, failures))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mismatch {
    MissingInSource(String),
    MissingInImage(String),
    Kind { path: String, image: EntryType },
    Content(String),
    OriginalSize { path: String, stored: u32, actual: u64 },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::MissingInSource(path) => write!(f, "{path}: missing in source"),
            Mismatch::MissingInImage(path) => write!(f, "{path}: missing in image"),
            Mismatch::Kind { path, image } => {
                write!(f, "{path}: {image:?} in image, something else in source")
            }
            Mismatch::Content(path) => write!(f, "{path}: content differs"),
            Mismatch::OriginalSize {
                path,
                stored,
                actual,
            } => write!(f, "{path}: stored original size {stored}, source has {actual}"),
        }
    }
}

/// Walks the image against `source` and collects every difference.
fn compare(image: &Image<'_>, source: &Path) -> Result<Vec<Mismatch>> {
    let mut mismatches = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for walked in image.walk("/")? {
        let walked = walked?;
        let relative = walked.path.trim_start_matches('/').to_string();
        let source_path = source.join(&relative);
        seen.insert(PathBuf::from(&relative));
        let Ok(metadata) = std::fs::metadata(&source_path) else {
            mismatches.push(Mismatch::MissingInSource(walked.path));
            continue;
        };
        match walked.entry.kind() {
            EntryType::Directory if !metadata.is_dir() => {
                mismatches.push(Mismatch::Kind {
                    path: walked.path,
                    image: EntryType::Directory,
                });
            }
            EntryType::File if !metadata.is_file() => {
                mismatches.push(Mismatch::Kind {
                    path: walked.path,
                    image: EntryType::File,
                });
            }
            EntryType::Directory => {}
            EntryType::File => {
                let expected = std::fs::read(&source_path)
                    .with_context(|| format!("Couldn't read file {}", source_path.display()))?;
                let mut actual = Vec::new();
                std::io::Read::read_to_end(&mut drofs::EntryReader::new(&walked.entry), &mut actual)
                    .with_context(|| format!("Couldn't read {} from image", walked.path))?;
                if actual != expected {
                    mismatches.push(Mismatch::Content(walked.path.clone()));
                }
                if let Some(stored) = walked.entry.original_size() {
                    if u64::from(stored) != metadata.len() {
                        mismatches.push(Mismatch::OriginalSize {
                            path: walked.path,
                            stored,
                            actual: metadata.len(),
                        });
                    }
                }
            }
        }
    }

    for item in walkdir::WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Ok(relative) = item.path().strip_prefix(source) else {
            continue;
        };
        if !seen.contains(relative) {
            mismatches.push(Mismatch::MissingInImage(format!(
                "/{}",
                relative.to_string_lossy()
            )));
        }
    }
    Ok(mismatches)
}

fn list_paths(image: &Image<'_>) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for walked in image.walk("/")? {
        let walked = walked?;
        if walked.entry.is_dir() {
            paths.push(format!("{}/", walked.path));
        } else {
            paths.push(walked.path);
        }
    }
    Ok(paths)
}

fn print_tree(image: &Image<'_>, dir: &Entry<'_>, last_depths: &mut Vec<bool>) -> Result<()> {
    let len = dir.children_len();
    for (i, child) in image.children(dir).enumerate() {
        let child = child?;
        let is_last = i + 1 == len;
        let name = String::from_utf8_lossy(child.name()).to_string();
        if child.is_dir() {
            println!("{} {}", tree_ident(last_depths, is_last), name.blue().bold());
            last_depths.push(!is_last);
            print_tree(image, &child, last_depths)?;
            last_depths.pop();
        } else if child.is_compressed() {
            println!("{} {} {}", tree_ident(last_depths, is_last), name, "[z]".yellow());
        } else {
            println!("{} {}", tree_ident(last_depths, is_last), name);
        }
    }
    Ok(())
}

fn tree_ident(last_depths: &[bool], is_last: bool) -> String {
    let mut ident = String::new();
    for open in last_depths {
        if *open {
            ident.push_str("│   ");
        } else {
            ident.push_str("    ");
        }
    }
    if is_last {
        ident.push('└')
    } else {
        ident.push('├')
    }
    ident.push_str(&"─".repeat(2));
    ident
}

fn unpack(image: &Image<'_>, out: &Path) -> Result<()> {
    for walked in image.walk("/")? {
        let walked = walked?;
        let name = walked.entry.name();
        if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') {
            bail!("Refusing to unpack {} outside of {}", walked.path, out.display());
        }
        let path = out.join(walked.path.trim_start_matches('/'));
        match walked.entry.kind() {
            EntryType::Directory => {
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Couldn't create directory {}", path.display()))?;
            }
            EntryType::File => {
                let mut reader = drofs::EntryReader::new(&walked.entry);
                let mut f = File::create(&path)
                    .with_context(|| format!("Couldn't create file {}", path.display()))?;
                std::io::copy(&mut reader, &mut f)
                    .with_context(|| format!("Couldn't write entry to {}", path.display()))?;
                f.flush()?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct EntryInfo {
    #[serde(rename = "type")]
    _type: EntryType,
    name: String,
    offset: u32,
    data_length: usize,
    data_checksum: String,
    compressed: bool,
    flags: u8,
    metadata: Vec<MetadataInfo>,
    children: usize,
}

#[derive(Debug, Clone, Serialize)]
struct MetadataInfo {
    tag: MetadataTag,
    length: u16,
    value: String,
}

impl EntryInfo {
    fn new(entry: &Entry<'_>) -> Self {
        Self {
            _type: entry.kind(),
            name: String::from_utf8_lossy(entry.name()).to_string(),
            offset: entry.offset(),
            data_length: entry.data().len(),
            data_checksum: format!("{:#010x}", entry.data_checksum()),
            compressed: entry.is_compressed(),
            flags: entry.flags().bits(),
            metadata: entry
                .metadata()
                .map(|m| MetadataInfo {
                    tag: m.tag(),
                    length: m.len(),
                    value: match (m.tag(), m.as_u32()) {
                        (MetadataTag::OriginalSize, Some(size)) => size.to_string(),
                        (MetadataTag::OriginalCrc32, Some(crc)) => format!("{crc:#010x}"),
                        (MetadataTag::Timestamp, Some(ts)) => format_timestamp(ts),
                        _ => base64::prelude::BASE64_STANDARD.encode(m.data()),
                    },
                })
                .collect(),
            children: entry.children_len(),
        }
    }
}

fn format_timestamp(timestamp: u32) -> String {
    match Local.timestamp_opt(i64::from(timestamp), 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp.to_string(),
    }
}
