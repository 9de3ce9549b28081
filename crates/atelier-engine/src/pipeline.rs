//! The two provider stages of an attempt: garment extraction, then a
//! concurrent synthesis fan-out.

use std::thread;

use atelier_contracts::request::{AspectRatio, ImageBlob, SceneMode};

use crate::client::ImageClient;
use crate::error::GenerationError;
use crate::prompts::PromptLibrary;
use crate::provider::{CallConfig, PromptPart};

pub use crate::prompts::SHOTS_PER_ATTEMPT;

/// Provider calls one attempt costs: extraction plus every synthesis shot.
pub const ATTEMPT_COST: usize = 1 + SHOTS_PER_ATTEMPT;

/// Settled results of one fan-out, in dispatch order.
#[derive(Debug)]
pub struct SynthesisReport {
    pub shots: Vec<Result<ImageBlob, GenerationError>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedImages {
    pub images: Vec<ImageBlob>,
    pub partial_failure: bool,
}

impl SynthesisReport {
    /// Calls actually dispatched, successful or not.
    pub fn attempted(&self) -> usize {
        self.shots.len()
    }

    pub fn successes(&self) -> usize {
        self.shots.iter().filter(|shot| shot.is_ok()).count()
    }

    /// Keeps successful images in dispatch order. With no success at all the
    /// first error in dispatch order is surfaced as `AllAttemptsFailed`.
    pub fn aggregate(self) -> Result<SynthesizedImages, GenerationError> {
        let attempted = self.shots.len();
        let mut images = Vec::with_capacity(attempted);
        let mut first_error = None;
        for (index, shot) in self.shots.into_iter().enumerate() {
            match shot {
                Ok(image) => images.push(image),
                Err(err) => {
                    tracing::warn!(shot = index, kind = err.kind().as_str(), error = %err, "synthesis call failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if images.is_empty() {
            let first = first_error.unwrap_or(GenerationError::EmptyOrInvalidResponse);
            return Err(GenerationError::AllAttemptsFailed {
                stage: "synthesis",
                attempted,
                first: Box::new(first),
            });
        }
        Ok(SynthesizedImages {
            partial_failure: images.len() < attempted,
            images,
        })
    }
}

/// Isolates the garment from its source photo. The provider is asked for a
/// transparent background, so the result is tagged as PNG.
pub fn extract_garment(
    client: &ImageClient,
    prompts: &PromptLibrary,
    garment: &ImageBlob,
) -> Result<ImageBlob, GenerationError> {
    let parts = [
        PromptPart::text(prompts.extraction_prompt()?),
        PromptPart::Image(garment.clone()),
    ];
    let extracted = client.call(&parts, &CallConfig::default())?;
    Ok(ImageBlob::png(extracted.bytes))
}

pub fn generate_scenes(
    client: &ImageClient,
    prompts: &PromptLibrary,
    garment: &ImageBlob,
    scene: &SceneMode,
    aspect_ratio: AspectRatio,
    color_hint: Option<&str>,
    on_progress: &(dyn Fn(usize) + Sync),
) -> Result<SynthesisReport, GenerationError> {
    let calls = prompts
        .scene_prompts(scene, aspect_ratio, color_hint)?
        .into_iter()
        .map(|prompt| vec![PromptPart::text(prompt), PromptPart::Image(garment.clone())])
        .collect();
    Ok(fan_out(client, calls, aspect_ratio, on_progress))
}

/// Every call carries the same prompt: template image first, garment second.
pub fn generate_locked_scene(
    client: &ImageClient,
    prompts: &PromptLibrary,
    garment: &ImageBlob,
    template: &ImageBlob,
    aspect_ratio: AspectRatio,
    on_progress: &(dyn Fn(usize) + Sync),
) -> Result<SynthesisReport, GenerationError> {
    let prompt = prompts.locked_scene_prompt(aspect_ratio)?;
    let calls = (0..SHOTS_PER_ATTEMPT)
        .map(|_| {
            vec![
                PromptPart::text(prompt.clone()),
                PromptPart::Image(template.clone()),
                PromptPart::Image(garment.clone()),
            ]
        })
        .collect();
    Ok(fan_out(client, calls, aspect_ratio, on_progress))
}

fn fan_out(
    client: &ImageClient,
    calls: Vec<Vec<PromptPart>>,
    aspect_ratio: AspectRatio,
    on_progress: &(dyn Fn(usize) + Sync),
) -> SynthesisReport {
    let config = CallConfig::with_aspect_ratio(aspect_ratio);
    let jobs = calls
        .into_iter()
        .map(|parts| move || client.call(&parts, &config))
        .collect();
    SynthesisReport {
        shots: settle_all(jobs, on_progress),
    }
}

/// Spawns every job before joining any, then collects each outcome.
/// A panicking or unspawnable job settles as a transport failure.
fn settle_all<T, F>(
    jobs: Vec<F>,
    on_progress: &(dyn Fn(usize) + Sync),
) -> Vec<Result<T, GenerationError>>
where
    T: Send,
    F: FnOnce() -> Result<T, GenerationError> + Send,
{
    thread::scope(|scope| {
        let handles = jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| {
                on_progress(index);
                tracing::debug!(shot = index, "dispatching synthesis call");
                thread::Builder::new()
                    .name(format!("atelier-shot-{index}"))
                    .spawn_scoped(scope, job)
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    Err(GenerationError::NetworkOrTransport(
                        "synthesis call panicked".to_string(),
                    ))
                }),
                Err(err) => Err(GenerationError::NetworkOrTransport(format!(
                    "synthesis call could not start: {err}"
                ))),
            })
            .collect()
    })
}
