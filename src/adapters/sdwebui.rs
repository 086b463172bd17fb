//! Stable Diffusion WebUI image synthesis (`/sdapi/v1/txt2img`).

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{CollaboratorError, ImageSynthesizer};

const NEGATIVE_PROMPT: &str = "nsfw, blurry, low quality, low resolution, cropped, deformed, \
    disfigured, poorly drawn, bad anatomy, extra limbs, missing limbs, mutation, ugly, grainy, \
    jpeg artifacts, watermarks, text, typography, out of frame, duplicate, bad hands, signature";

pub struct SdWebUi {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: u32,
    width: u32,
    height: u32,
    seed: i64,
    sampler_name: &'a str,
    scheduler: &'a str,
    batch_size: u32,
    n_iter: u32,
    cfg_scale: f32,
    distilled_cfg_scale: f32,
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
}

impl SdWebUi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request(directive: &str) -> Txt2ImgRequest<'_> {
        Txt2ImgRequest {
            prompt: directive,
            negative_prompt: NEGATIVE_PROMPT,
            steps: 20,
            // Portrait; the clip stage scales up to 1080x1920
            width: 540,
            height: 960,
            seed: -1,
            sampler_name: "Euler",
            scheduler: "Simple",
            batch_size: 1,
            n_iter: 1,
            cfg_scale: 1.0,
            distilled_cfg_scale: 3.5,
        }
    }
}

/// Decode the first image of a txt2img reply
fn decode_first_image(reply: Txt2ImgResponse) -> Result<Vec<u8>, CollaboratorError> {
    let encoded = reply
        .images
        .into_iter()
        .next()
        .ok_or_else(|| CollaboratorError::Validation("no images in response".to_string()))?;

    // Some builds prefix a data URL header
    let payload = encoded
        .split_once(',')
        .filter(|(head, _)| head.starts_with("data:"))
        .map(|(_, body)| body)
        .unwrap_or(&encoded);

    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| CollaboratorError::Validation(format!("image is not base64: {e}")))
}

#[async_trait]
impl ImageSynthesizer for SdWebUi {
    fn name(&self) -> &str {
        "sd-webui"
    }

    async fn synthesize_image(&self, directive: &str) -> Result<Vec<u8>, CollaboratorError> {
        let url = format!("{}/sdapi/v1/txt2img", self.base_url.trim_end_matches('/'));
        let reply: Txt2ImgResponse = self
            .client
            .post(url)
            .json(&Self::request(directive))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| CollaboratorError::Validation(e.to_string()))?;

        decode_first_image(reply)
    }
}
