use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use lustre_contracts::images::{ImageStatus, OperationKind, ScaleOption, SettingsPatch};
use lustre_contracts::ledger::HistoryLedger;
use lustre_engine::{
    DescribeApi, HttpDescribeClient, HttpUpscaleClient, NewUpload, SessionStore, UpscaleApi,
};

#[derive(Debug, Parser)]
#[command(name = "lustre-rs", version, about = "Image enhancement session CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enhance or upscale one or more images through the session store.
    Enhance(EnhanceArgs),
    /// Generate a reproduction prompt for one image.
    Describe(DescribeArgs),
    /// Print the persisted enhancement history.
    History(HistoryArgs),
}

#[derive(Debug, Parser)]
struct EnhanceArgs {
    /// Input image files (at most 5 per session).
    #[arg(long, required = true, num_args = 1..)]
    input: Vec<PathBuf>,
    /// Scale multiplier: 1, 2 or 4.
    #[arg(long, default_value_t = 2)]
    scale: u32,
    /// Pure upscaling, no creative re-rendering.
    #[arg(long)]
    no_enhance: bool,
    #[arg(long)]
    creativity: Option<f64>,
    #[arg(long)]
    adherence: Option<f64>,
    /// Fixed prompt; skips automatic description generation.
    #[arg(long)]
    prompt: Option<String>,
    /// Run description generation before enhancing.
    #[arg(long)]
    describe: bool,
    /// Output directory; defaults to each input's directory.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct DescribeArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("lustre-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Enhance(args) => run_enhance(args),
        Command::Describe(args) => run_describe(args),
        Command::History(args) => run_history(args),
    }
}

fn run_enhance(args: EnhanceArgs) -> Result<i32> {
    let scale = ScaleOption::from_multiplier(args.scale)
        .with_context(|| format!("scale must be 1, 2 or 4, got {}", args.scale))?;
    let ledger = HistoryLedger::open(history_path(args.state_dir.as_deref()));
    let mut session =
        SessionStore::new(HttpUpscaleClient::new(), HttpDescribeClient::new()).with_ledger(ledger);

    // Add one file at a time so outputs can be matched back to inputs even
    // when some files fail validation.
    let mut accepted = Vec::new();
    for path in &args.input {
        let upload = read_upload(path)?;
        let added = session.add_images(vec![upload]);
        drain_notices(&mut session);
        if let Some(id) = added.first() {
            accepted.push((*id, path.clone()));
        }
    }
    if accepted.is_empty() {
        bail!("no valid input images");
    }

    let mut patch = SettingsPatch::default()
        .scale(scale)
        .enhance(!args.no_enhance);
    if let Some(creativity) = args.creativity {
        patch = patch.creativity(creativity);
    }
    if let Some(adherence) = args.adherence {
        patch = patch.adherence(adherence);
    }
    if let Some(prompt) = &args.prompt {
        patch = patch.prompt(prompt.clone());
    }
    for (id, _) in &accepted {
        session.select_image(Some(*id));
        session.update_settings(patch.clone());
    }

    if args.describe && args.prompt.is_none() && !args.no_enhance {
        session.pump_prompt_queue();
        drain_notices(&mut session);
        for (id, _) in &accepted {
            if let Some(image) = session.image(*id) {
                if let Some(prompt) = image.settings.prompt.as_deref() {
                    println!("{}: {prompt}", image.display_name);
                }
            }
        }
    }

    let mut failures = 0;
    for (id, path) in &accepted {
        session.select_image(Some(*id));
        if !session.can_enhance() {
            eprintln!("skipping {} (not eligible for enhancement)", path.display());
            failures += 1;
            continue;
        }
        session.enhance_selected();
        drain_notices(&mut session);

        let Some(image) = session.image(*id) else {
            continue;
        };
        if image.status != ImageStatus::Complete {
            failures += 1;
            continue;
        }
        let handle = image
            .enhanced
            .context("complete image missing enhanced handle")?;
        let bytes = session
            .blobs()
            .bytes(handle)
            .context("enhanced handle not resolvable")?;
        let target = output_path(path, args.out.as_deref());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, bytes)
            .with_context(|| format!("failed writing {}", target.display()))?;
        println!("wrote {}", target.display());
    }

    Ok(if failures == 0 { 0 } else { 1 })
}

fn run_describe(args: DescribeArgs) -> Result<i32> {
    let mut session = SessionStore::new(HttpUpscaleClient::new(), HttpDescribeClient::new());
    let upload = read_upload(&args.input)?;
    let added = session.add_images(vec![upload]);
    drain_notices(&mut session);
    let Some(id) = added.first().copied() else {
        bail!("{} failed validation", args.input.display());
    };

    session.pump_prompt_queue();
    drain_notices(&mut session);

    let image = session.image(id).context("image dropped mid-session")?;
    match image.settings.prompt.as_deref() {
        Some(prompt) => {
            println!("{prompt}");
            Ok(0)
        }
        None => Ok(1),
    }
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let ledger = HistoryLedger::open(history_path(args.state_dir.as_deref()));
    if ledger.records().is_empty() {
        println!("no enhancement history");
        return Ok(0);
    }
    for record in ledger.records() {
        println!(
            "{}  {}  {}  scale={}x creativity={:.2} adherence={:.2}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.display_name,
            operation_label(record.operation),
            record.settings.scale.multiplier(),
            record.settings.creativity,
            record.settings.adherence,
        );
    }
    Ok(0)
}

fn read_upload(path: &Path) -> Result<NewUpload> {
    let bytes =
        fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let display_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    Ok(NewUpload::new(display_name, bytes))
}

fn output_path(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let ext = input
        .extension()
        .map(|ext| ext.to_string_lossy().to_string())
        .unwrap_or_else(|| "png".to_string());
    let file_name = format!("{stem}_enhanced.{ext}");
    match out_dir {
        Some(dir) => dir.join(file_name),
        None => input.with_file_name(file_name),
    }
}

fn history_path(state_dir: Option<&Path>) -> PathBuf {
    let dir = state_dir.map(Path::to_path_buf).unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lustre")
    });
    dir.join("history.json")
}

fn operation_label(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Enhanced => "enhanced",
        OperationKind::Upscaled => "upscaled",
    }
}

fn drain_notices<U: UpscaleApi, D: DescribeApi>(session: &mut SessionStore<U, D>) {
    use lustre_contracts::notices::NoticeKind;
    if let Some(notice) = session.notices().success() {
        println!("{}", notice.message);
        session.notices_mut().dismiss(NoticeKind::Success);
    }
    if let Some(notice) = session.notices().error() {
        eprintln!("error: {}", notice.message);
        session.notices_mut().dismiss(NoticeKind::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_appends_enhanced_suffix() {
        assert_eq!(
            output_path(Path::new("/tmp/barn.jpg"), None),
            PathBuf::from("/tmp/barn_enhanced.jpg")
        );
        assert_eq!(
            output_path(Path::new("barn.png"), Some(Path::new("/out"))),
            PathBuf::from("/out/barn_enhanced.png")
        );
        assert_eq!(
            output_path(Path::new("barn"), None),
            PathBuf::from("barn_enhanced.png")
        );
    }

    #[test]
    fn history_path_honors_override() {
        assert_eq!(
            history_path(Some(Path::new("/state"))),
            PathBuf::from("/state/history.json")
        );
    }

    #[test]
    fn cli_parses_enhance_flags() {
        let cli = Cli::parse_from([
            "lustre-rs",
            "enhance",
            "--input",
            "a.jpg",
            "b.jpg",
            "--scale",
            "4",
            "--no-enhance",
        ]);
        match cli.command {
            Command::Enhance(args) => {
                assert_eq!(args.input.len(), 2);
                assert_eq!(args.scale, 4);
                assert!(args.no_enhance);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
