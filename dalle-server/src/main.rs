use anyhow::Result;
use clap::Parser;
use dalle_core::{
    load_model, DeviceMap, GenerationRequest, ModelSpec, Residency, SamplingConfig, DALLE_MODEL,
    DALLE_REVISION, VQGAN_MODEL, VQGAN_REVISION,
};
use dalle_server::{router, AppState};
use hf_hub::api::tokio::Api;
use tokio::{self, net::TcpListener};
use tracing::info;
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "DALL·E mini image generation server")]
struct Args {
    /// Port to bind the server to
    port: u16,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerators to replicate the model on, e.g. `0,1`
    #[arg(long, default_value = "0")]
    devices: DeviceMap,

    /// Generator repository
    #[arg(long, default_value = DALLE_MODEL)]
    model: String,

    /// Generator revision
    #[arg(long, default_value = DALLE_REVISION)]
    revision: String,

    /// VQGAN repository
    #[arg(long, default_value = VQGAN_MODEL)]
    vqgan: String,

    /// VQGAN revision
    #[arg(long, default_value = VQGAN_REVISION)]
    vqgan_revision: String,

    /// Load models onto the devices per request and free them afterwards
    #[arg(long)]
    low_vram: bool,

    /// Predictions processed together on one device
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Reject requests asking for more images than this
    #[arg(long)]
    max_images: Option<u32>,

    /// Top-k sampling, 0 disables it
    #[arg(long, default_value_t = 50)]
    top_k: usize,

    /// Nucleus sampling threshold
    #[arg(long)]
    top_p: Option<f64>,

    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// Super conditioning scale, 1.0 disables it
    #[arg(long, default_value_t = 10.0)]
    condition_scale: f64,

    /// Skip the warm-up generation at startup
    #[arg(long)]
    skip_warmup: bool,
}

impl Args {
    fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            self.devices.clone()
        }
    }

    fn spec(&self) -> ModelSpec {
        ModelSpec {
            model: self.model.clone(),
            revision: self.revision.clone(),
            vqgan: self.vqgan.clone(),
            vqgan_revision: self.vqgan_revision.clone(),
            residency: if self.low_vram {
                Residency::OnDemand
            } else {
                Residency::Resident
            },
            sampling: SamplingConfig {
                top_k: (self.top_k > 0).then_some(self.top_k),
                top_p: self.top_p,
                temperature: self.temperature,
                condition_scale: self.condition_scale,
            },
            batch_size: self.batch_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("Starting DALL-E server. This might take up to two minutes.");

    let model = load_model(args.spec(), Api::new()?, args.device_map()).await?;

    if !args.skip_warmup {
        let warm = model.clone();
        tokio::task::spawn_blocking(move || warm.run(GenerationRequest::new("warm-up", 1)))
            .await??;
        info!("Warm-up generation done");
    }

    // --- Build axum router with shared state ---
    let app = router(AppState {
        model,
        max_images: args.max_images,
    });

    // --- Start the server ---
    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("DALL-E server is up and running on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
