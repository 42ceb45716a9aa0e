use clap::arg_enum;
use fwpatch::diff::diff_images;
use fwpatch::{Feature, Ledger, Model, Patcher, Thumb};
use log::{info, warn};
use snafu::{OptionExt, ResultExt, Snafu};
use std::fs;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Mode {
        Diff,
        Patch,
        Revert
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "fwpatch", about = "Signature based firmware patcher")]
struct Options {
    #[structopt(
        short,
        long,
        possible_values = &Mode::variants(),
        case_insensitive = true,
        default_value = "Diff"
    )]
    mode: Mode,
    /// Unchanged bytes tolerated inside one diff section
    #[structopt(short, long, default_value = "1")]
    bad_bytes: usize,
    /// Controller model, e.g. g2, zt3pro, 4max
    #[structopt(long)]
    model: Option<Model>,
    /// Feature to apply, e.g. `speed_params=30:25:20:6`. Repeatable
    #[structopt(short, long = "feature", number_of_values = 1)]
    features: Vec<Feature>,
    /// Print the ledger instead of writing the patched image
    #[structopt(long)]
    dry_run: bool,
    /// Where to write the result, defaults to `<INPUT>.patched`
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
    #[structopt(index = 1, required = true, name = "INPUT", parse(from_os_str))]
    input: PathBuf,
    /// Patched image for diff, ledger for revert
    #[structopt(index = 2, name = "OTHER", parse(from_os_str))]
    other: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("could not read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not write {}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{} needs {}", mode, what))]
    MissingArgument { mode: Mode, what: &'static str },

    #[snafu(display("feature {} failed", feature))]
    Feature {
        feature: String,
        source: fwpatch::Error,
    },

    #[snafu(transparent)]
    Library { source: fwpatch::Error },
}

type Result<T, E = CliError> = std::result::Result<T, E>;

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).context(ReadSnafu { path })
}

fn write(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    fs::write(path, contents).context(WriteSnafu { path })?;
    info!("wrote {}", path.display());
    Ok(())
}

fn with_extension(path: &Path, extension: &str) -> PathBuf {
    let mut path = path.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

fn diff(opt: &Options) -> Result<()> {
    let other = opt.other.as_deref().context(MissingArgumentSnafu {
        mode: opt.mode,
        what: "a patched image",
    })?;
    let input = read(&opt.input)?;
    let patched = read(other)?;

    let ledger: Ledger = diff_images(&input, &patched, opt.bad_bytes)?
        .into_iter()
        .collect();
    for record in &ledger {
        info!(
            "{} @ 0x{:x}: {:02X?}",
            record.name, record.offset, record.post
        );
    }

    let mut ledger_file = opt.input.clone();
    ledger_file.set_extension("rbp");
    write(&ledger_file, ledger.to_bincode()?)?;
    ledger_file.set_extension("json");
    write(&ledger_file, ledger.to_json()?)
}

fn patch(opt: &Options) -> Result<()> {
    let model = opt.model.context(MissingArgumentSnafu {
        mode: opt.mode,
        what: "--model",
    })?;
    if opt.features.is_empty() {
        return MissingArgumentSnafu {
            mode: opt.mode,
            what: "at least one --feature",
        }
        .fail();
    }

    let mut image = read(&opt.input)?;
    let thumb = Thumb;
    let mut patcher = Patcher::new(&mut image, model, &thumb);
    let mut ledger = Ledger::new();
    for feature in &opt.features {
        let records = patcher.apply_feature(feature).context(FeatureSnafu {
            feature: feature.name(),
        })?;
        if records.is_empty() {
            warn!("{} changed nothing on {}", feature.name(), model);
        }
        ledger.extend(records);
    }

    let json = ledger.to_json()?;
    if opt.dry_run {
        println!("{}", json);
        return Ok(());
    }

    let output = opt
        .output
        .clone()
        .unwrap_or_else(|| with_extension(&opt.input, "patched"));
    write(&output, &image)?;
    write(&with_extension(&output, "json"), json)
}

fn revert(opt: &Options) -> Result<()> {
    let ledger_file = opt.other.as_deref().context(MissingArgumentSnafu {
        mode: opt.mode,
        what: "a ledger",
    })?;
    let raw = read(ledger_file)?;
    let ledger = match ledger_file.extension().and_then(|e| e.to_str()) {
        Some("json") => Ledger::from_json(&String::from_utf8_lossy(&raw)),
        _ => Ledger::from_bincode(&raw),
    }?;

    let mut image = read(&opt.input)?;
    let reverted = ledger.revert(&mut image)?;
    info!("reverted {} patches", reverted.len());

    let output = opt
        .output
        .clone()
        .unwrap_or_else(|| with_extension(&opt.input, "reverted"));
    write(&output, &image)
}

#[snafu::report]
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Options::from_args();
    log::debug!("{:?}", opt);
    match opt.mode {
        Mode::Diff => diff(&opt),
        Mode::Patch => patch(&opt),
        Mode::Revert => revert(&opt),
    }
}
