use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use doorman_core::{Config, IdentityStore, OnnxAnalyzer, Outcome, RecognitionEngine};
use doorman_hw::{Camera, GpioActuator, Relay};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "doorman", about = "Doorman face-recognition door access CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a trusted identity from a reference photo
    Enroll {
        /// Name to store the identity under
        #[arg(short, long)]
        name: String,
        /// Image containing the person's face (the largest face is used)
        image: PathBuf,
    },
    /// List enrolled identities
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove an enrolled identity
    Remove {
        /// Identity name
        name: String,
    },
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame and run recognition on it
    Test,
    /// Pulse the door relay
    Unlock {
        /// Hold duration in seconds (defaults to the configured unlock time)
        #[arg(long)]
        secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { name, image } => enroll(&config, &name, &image),
        Commands::List { json } => list(&config, json),
        Commands::Remove { name } => remove(&config, &name),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::Test => test_camera(&config),
        Commands::Unlock { secs } => {
            let hold = secs.map(Duration::from_secs).unwrap_or_else(|| config.unlock_hold());
            unlock(&config, hold).await
        }
    }
}

fn engine(config: &Config, store: Arc<IdentityStore>) -> Result<RecognitionEngine> {
    let analyzer = OnnxAnalyzer::load(&config.model_dir).context("failed to load face models")?;
    Ok(RecognitionEngine::new(
        Box::new(analyzer),
        store,
        config.confidence_threshold,
    ))
}

fn enroll(config: &Config, name: &str, image_path: &Path) -> Result<()> {
    let store = Arc::new(IdentityStore::load(config.store_path())?);
    if store.contains(name) {
        bail!("identity '{name}' already exists");
    }

    let photo = image::open(image_path)
        .with_context(|| format!("failed to read {}", image_path.display()))?;
    let image = photo.to_luma8();
    let engine = engine(config, store.clone())?;
    let (region, encoding) = engine
        .encode_largest(&image)
        .with_context(|| format!("cannot enroll from {}", image_path.display()))?;
    store.add(name, encoding)?;

    let known_dir = config.known_faces_dir();
    std::fs::create_dir_all(&known_dir)?;
    let reference = known_dir.join(format!("{name}.jpg"));
    photo
        .to_rgb8()
        .save(&reference)
        .with_context(|| format!("identity stored but failed to save {}", reference.display()))?;

    println!(
        "Enrolled '{name}' (face {}x{} at {},{})",
        region.width(),
        region.height(),
        region.left,
        region.top
    );
    Ok(())
}

fn list(config: &Config, json: bool) -> Result<()> {
    let store = IdentityStore::load(config.store_path())?;
    let records = store.records();

    if json {
        let entries: Vec<_> = records
            .iter()
            .map(|r| serde_json::json!({ "name": r.name, "dimensions": r.encoding.len() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }
    for r in &records {
        println!("{}  ({}-dim)", r.name, r.encoding.len());
    }
    Ok(())
}

fn remove(config: &Config, name: &str) -> Result<()> {
    let store = IdentityStore::load(config.store_path())?;
    if !store.remove(name)? {
        bail!("no identity named '{name}'");
    }
    let reference = config.known_faces_dir().join(format!("{name}.jpg"));
    if reference.exists() {
        std::fs::remove_file(&reference)
            .with_context(|| format!("failed to remove {}", reference.display()))?;
    }
    println!("Removed '{name}'");
    Ok(())
}

fn test_camera(config: &Config) -> Result<()> {
    println!("Opening {}...", config.camera_device);
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
    println!("  negotiated {}x{}", camera.width, camera.height);

    let image = camera
        .capture_frame()?
        .into_image()
        .context("camera returned an invalid frame")?;

    let store = Arc::new(IdentityStore::load(config.store_path())?);
    let engine = engine(config, store)?;
    let faces = engine.detect(&image)?;
    println!("  faces detected: {}", faces.len());

    match engine.process(&image).map(|r| r.outcome) {
        None => println!("  no face to recognize"),
        Some(Outcome::Matched { name, distance }) => {
            println!("  recognized '{name}' (distance {distance:.3})")
        }
        Some(Outcome::Unknown) => println!("  unknown face"),
        Some(Outcome::Unidentifiable) => println!("  face found but could not be encoded"),
    }
    Ok(())
}

async fn unlock(config: &Config, hold: Duration) -> Result<()> {
    let actuator = GpioActuator::open(config.relay_gpio_pin, config.relay_active_low)
        .context("failed to configure relay GPIO")?;
    let relay = Relay::new(Arc::new(actuator))?;

    println!("Unlocking for {}s (GPIO {})...", hold.as_secs(), config.relay_gpio_pin);
    let result = tokio::select! {
        r = relay.unlock(hold) => r.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => Ok(()),
    };
    relay.cleanup();
    result?;
    println!("Locked");
    Ok(())
}
