use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use atelier_contracts::events::EventWriter;
use atelier_contracts::outcome::OrchestratorState;
use atelier_contracts::request::{AspectRatio, GenerationRequest, ImageBlob};
use atelier_contracts::runs::summary::{now_utc_iso, write_summary, RunSummary};
use atelier_contracts::scenes::{SceneCatalog, SceneSelector};
use atelier_engine::config::non_empty_env;
use atelier_engine::queue::DEFAULT_TICK_INTERVAL;
use atelier_engine::{AtelierEngine, AttemptReport, EngineConfig, ProviderKind, SystemClock};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_QUEUED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Garment-to-scene fashion image generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract a garment and render it in a scene.
    Generate(GenerateArgs),
    /// List the built-in scene catalog.
    Scenes,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    garment: PathBuf,
    /// Scene name from the catalog (case-insensitive).
    #[arg(long, conflicts_with = "locked_scene")]
    scene: Option<String>,
    /// Free-form scene description; keeps the selected scene's name.
    #[arg(long, conflicts_with = "locked_scene")]
    prompt: Option<String>,
    /// Template photo whose pose, lighting and composition are kept.
    #[arg(long)]
    locked_scene: Option<PathBuf>,
    #[arg(long, default_value = "9:16")]
    aspect_ratio: AspectRatio,
    /// Outfit colors for the multi-color scene, e.g. "red, black, white".
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    provider: Option<ProviderKind>,
    #[arg(long)]
    model: Option<String>,
    /// How long to keep retrying a request parked by the quota window.
    #[arg(long, default_value_t = 0)]
    wait_secs: u64,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(EXIT_FAILED);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Scenes => {
            print!("{}", render_scene_list(&SceneCatalog::default()));
            Ok(EXIT_OK)
        }
    }
}

fn render_scene_list(catalog: &SceneCatalog) -> String {
    let mut out = String::new();
    for scene in catalog.list() {
        let marker = if scene.is_multi_color() {
            " (accepts --color)"
        } else {
            ""
        };
        out.push_str(&format!("{}{marker}\n    {}\n", scene.name, scene.prompt));
    }
    out
}

fn resolve_config(args: &GenerateArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_lookup(non_empty_env)?;
    if let Some(provider) = args.provider {
        config.provider = provider;
    }
    if let Some(model) = args.model.as_deref().map(str::trim).filter(|model| !model.is_empty()) {
        config.image_model = model.to_string();
    }
    Ok(config.validated()?)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = resolve_config(&args)?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("creating output directory {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(&events_path, uuid::Uuid::new_v4().to_string());

    let request = build_request(&args)?;
    let provider = config.provider.as_str();
    let engine = AtelierEngine::new(config, Arc::new(SystemClock), Some(events.clone()))?;
    let started_at = now_utc_iso();

    let controller = engine.controller();
    let mut report = controller.submit(request.clone());
    if report.is_queued() && args.wait_secs > 0 {
        eprintln!(
            "Quota window is full; waiting up to {}s for capacity.",
            args.wait_secs
        );
        if let Some(last) =
            controller.run_until_settled(DEFAULT_TICK_INTERVAL, Duration::from_secs(args.wait_secs))
        {
            report = last;
        }
    }

    let images = write_images(&args.out, &report)?;
    let summary = build_summary(
        events.session_id(),
        started_at,
        &request,
        &report,
        images.clone(),
    );
    let mut extra = Map::new();
    extra.insert("attempt_id".to_string(), json!(report.attempt_id));
    extra.insert("provider".to_string(), json!(provider));
    extra.insert(
        "events_path".to_string(),
        json!(events_path.to_string_lossy()),
    );
    write_summary(&args.out.join("summary.json"), &summary, Some(&extra))?;

    match &report.state {
        OrchestratorState::Succeeded(outcome) => {
            for image in &images {
                println!("{}", args.out.join(image).display());
            }
            if outcome.partial_failure {
                eprintln!(
                    "Some shots failed; kept {} of {} images.",
                    outcome.images.len(),
                    atelier_engine::SHOTS_PER_ATTEMPT
                );
            }
            Ok(EXIT_OK)
        }
        OrchestratorState::Queued => {
            eprintln!("Request is still queued: the provider call budget is exhausted. Try again shortly.");
            Ok(EXIT_QUEUED)
        }
        OrchestratorState::Failed(failure) => {
            eprintln!("Generation failed: {failure}");
            Ok(EXIT_FAILED)
        }
        other => Err(anyhow!("attempt ended in unexpected state '{}'", other.label())),
    }
}

fn build_request(args: &GenerateArgs) -> Result<GenerationRequest> {
    let garment = read_image(&args.garment)?;
    if let Some(template_path) = args.locked_scene.as_deref() {
        if args.color.is_some() {
            tracing::warn!("--color is ignored with --locked-scene");
        }
        let template = read_image(template_path)?;
        return Ok(GenerationRequest::locked_scene(
            garment,
            template,
            args.aspect_ratio,
        ));
    }

    let selection = SceneSelector::new(None)
        .select(args.scene.as_deref(), args.prompt.as_deref())
        .map_err(|err| anyhow!(err))?;
    if let Some(reason) = selection.fallback_reason.as_deref() {
        if args.prompt.is_none() || args.scene.is_some() {
            eprintln!("{reason}");
        }
    }
    Ok(GenerationRequest::scene(
        garment,
        selection.scene.to_mode(),
        args.aspect_ratio,
        args.color.clone(),
    ))
}

fn read_image(path: &Path) -> Result<ImageBlob> {
    let Some(mime_type) = mime_for_path(path) else {
        bail!(
            "Unsupported image type for {} (expected png, jpg, jpeg, webp or gif)",
            path.display()
        );
    };
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("Image file is empty: {}", path.display());
    }
    Ok(ImageBlob::new(bytes, mime_type))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

/// Writes `image-01.png`, `image-02.png`, ... and returns the file names.
fn write_images(out_dir: &Path, report: &AttemptReport) -> Result<Vec<String>> {
    let Some(outcome) = report.outcome() else {
        return Ok(Vec::new());
    };
    let mut names = Vec::with_capacity(outcome.images.len());
    for (index, image) in outcome.images.iter().enumerate() {
        let name = format!(
            "image-{:02}.{}",
            index + 1,
            extension_for_mime(&image.mime_type)
        );
        let path = out_dir.join(&name);
        fs::write(&path, &image.bytes).with_context(|| format!("writing {}", path.display()))?;
        names.push(name);
    }
    Ok(names)
}

fn build_summary(
    session_id: &str,
    started_at: String,
    request: &GenerationRequest,
    report: &AttemptReport,
    images: Vec<String>,
) -> RunSummary {
    let failure = report.state.failure();
    let (consumed_call_count, partial_failure) = match report.outcome() {
        Some(outcome) => (outcome.consumed_call_count, outcome.partial_failure),
        None => (report.calls_charged, false),
    };
    RunSummary {
        session_id: session_id.to_string(),
        started_at,
        finished_at: now_utc_iso(),
        state: report.state.label().to_string(),
        mode: request.mode.label().to_string(),
        aspect_ratio: request.aspect_ratio.as_str().to_string(),
        images,
        consumed_call_count,
        partial_failure,
        failure_kind: failure.map(|failure| failure.kind),
        failure_message: failure.map(|failure| failure.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use atelier_contracts::request::GenerationMode;

    use super::*;

    fn parse(args: &[&str]) -> GenerateArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Generate(args) => args,
            Command::Scenes => panic!("expected generate"),
        }
    }

    #[test]
    fn generate_flags_parse_with_defaults() {
        let args = parse(&[
            "atelier",
            "generate",
            "--garment",
            "shirt.jpg",
            "--out",
            "run",
            "--provider",
            "dryrun",
        ]);
        assert_eq!(args.aspect_ratio, AspectRatio::Portrait);
        assert_eq!(args.provider, Some(ProviderKind::Dryrun));
        assert_eq!(args.wait_secs, 0);
        assert!(args.scene.is_none());
    }

    #[test]
    fn scene_conflicts_with_locked_scene() {
        let result = Cli::try_parse_from([
            "atelier",
            "generate",
            "--garment",
            "shirt.jpg",
            "--out",
            "run",
            "--scene",
            "Cafe terrace",
            "--locked-scene",
            "template.jpg",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_aspect_ratio_is_rejected() {
        let result = Cli::try_parse_from([
            "atelier",
            "generate",
            "--garment",
            "shirt.jpg",
            "--out",
            "run",
            "--aspect-ratio",
            "2:3",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn mime_and_extension_helpers() {
        assert_eq!(mime_for_path(Path::new("a/B.JPEG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a/b.tiff")), None);
        assert_eq!(extension_for_mime("image/webp"), "webp");
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }

    #[test]
    fn locked_scene_request_reads_template() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let garment = temp.path().join("shirt.jpg");
        let template = temp.path().join("template.png");
        fs::write(&garment, vec![1u8, 2, 3])?;
        fs::write(&template, vec![4u8, 5])?;

        let garment_arg = garment.to_string_lossy().to_string();
        let template_arg = template.to_string_lossy().to_string();
        let args = parse(&[
            "atelier",
            "generate",
            "--garment",
            &garment_arg,
            "--locked-scene",
            &template_arg,
            "--out",
            "run",
        ]);
        let request = build_request(&args)?;
        let GenerationMode::LockedScene(locked) = &request.mode else {
            panic!("expected locked scene");
        };
        assert_eq!(locked.template_image, ImageBlob::png(vec![4, 5]));
        assert_eq!(request.garment_image.mime_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn scene_request_resolves_catalog_name() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let garment = temp.path().join("shirt.png");
        fs::write(&garment, vec![1u8])?;
        let garment_arg = garment.to_string_lossy().to_string();
        let args = parse(&[
            "atelier",
            "generate",
            "--garment",
            &garment_arg,
            "--scene",
            "cafe TERRACE",
            "--color",
            "red",
            "--out",
            "run",
        ]);
        let request = build_request(&args)?;
        let GenerationMode::Scene(scene) = &request.mode else {
            panic!("expected scene");
        };
        assert_eq!(scene.scene_name, "Cafe terrace");
        assert_eq!(request.normalized_color_hint(), Some("red"));
        Ok(())
    }

    #[test]
    fn empty_garment_file_is_rejected() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let garment = temp.path().join("shirt.png");
        fs::write(&garment, Vec::<u8>::new())?;
        assert!(read_image(&garment).is_err());
        Ok(())
    }

    #[test]
    fn dryrun_generate_writes_images_and_summary() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let garment = temp.path().join("shirt.png");
        fs::write(&garment, vec![1u8, 2, 3])?;
        let out = temp.path().join("run");
        let garment_arg = garment.to_string_lossy().to_string();
        let out_arg = out.to_string_lossy().to_string();
        let args = parse(&[
            "atelier",
            "generate",
            "--garment",
            &garment_arg,
            "--out",
            &out_arg,
            "--provider",
            "dryrun",
        ]);

        assert_eq!(run_generate(args)?, EXIT_OK);
        for index in 1..=4 {
            assert!(out.join(format!("image-{index:02}.png")).is_file());
        }
        let summary: Value = serde_json::from_str(&fs::read_to_string(out.join("summary.json"))?)?;
        assert_eq!(summary["state"], "succeeded");
        assert_eq!(summary["consumed_call_count"], 5);
        assert_eq!(summary["provider"], "dryrun");

        let events = fs::read_to_string(out.join("events.jsonl"))?;
        let last: Value = serde_json::from_str(events.lines().last().unwrap_or_default())?;
        assert_eq!(last["type"], "attempt_succeeded");
        Ok(())
    }

    #[test]
    fn scene_list_marks_multi_color_scene() {
        let listing = render_scene_list(&SceneCatalog::default());
        assert!(listing.contains("Multi-color collection (accepts --color)"));
        assert!(listing.contains("Cafe terrace\n"));
    }
}
