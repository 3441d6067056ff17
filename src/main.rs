use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tryon_booth::backend::{catalog_name, DressCatalog, ObjectStorage, SessionStore, SupabaseBackend, TryOnSession};
use tryon_booth::capture::CaptureSession;
use tryon_booth::config::{CameraBackendKind, Config, ObserveStrategy};
use tryon_booth::error::SessionError;
use tryon_booth::flow::{GarmentChoice, TryOnFlow, TryOnOutcome};
use tryon_booth::media::{FacingMode, MediaDevices};
use tryon_booth::notify::LogNotifier;
use tryon_booth::observe::observer_for;
use tryon_booth::photo::PhotoLoader;
use tryon_booth::preview::PreviewRegistry;
use tryon_booth::rpicam::RpicamDevices;
use tryon_booth::validation::PhotoValidator;
use tryon_booth::virtual_camera::VirtualDevices;
use tryon_booth::vision::VisionClient;
use tryon_booth::{TryOnBooth, TryOnError};

#[derive(Parser)]
#[command(name = "tryon", version, about = "Virtual try-on booth")]
struct Cli {
    /// Configuration file (defaults to tryon_config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a photo, validate it and save it as JPEG
    Capture {
        #[arg(long, value_enum)]
        facing: Option<Facing>,
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Save without asking the vision service
        #[arg(long)]
        skip_validation: bool,
    },
    /// Validate an existing image file
    Validate { file: PathBuf },
    /// List the dress catalog
    Dresses,
    /// Run a complete try-on
    TryOn {
        #[command(flatten)]
        photo: PhotoSource,
        #[command(flatten)]
        garment: GarmentSource,
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
    },
    /// Follow an existing try-on session
    Watch {
        session_id: String,
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
    },
    /// Upload every image in a directory and point the catalog at it
    SeedCatalog { dir: PathBuf },
    /// Write a configuration file
    InitConfig {
        #[arg(long, value_enum, default_value_t = Preset::Default)]
        preset: Preset,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct PhotoSource {
    /// Use an image file as the model photo
    #[arg(long)]
    photo: Option<PathBuf>,
    /// Take the model photo with the camera
    #[arg(long)]
    camera: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct GarmentSource {
    /// Catalog dress id or name
    #[arg(long)]
    dress: Option<String>,
    #[arg(long)]
    dress_url: Option<String>,
    #[arg(long)]
    dress_file: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Facing {
    User,
    Environment,
}

impl From<Facing> for FacingMode {
    fn from(facing: Facing) -> Self {
        match facing {
            Facing::User => FacingMode::User,
            Facing::Environment => FacingMode::Environment,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Poll,
    Push,
}

impl From<Strategy> for ObserveStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Poll => ObserveStrategy::Poll,
            Strategy::Push => ObserveStrategy::Push,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    Default,
    Desktop,
    Kiosk,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Commands::InitConfig { preset, force } = &cli.command {
        return init_config(cli.config.as_deref(), *preset, *force);
    }

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };
    info!("Starting try-on booth ({:?} camera backend)", config.camera.backend);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Capture {
            facing,
            out,
            skip_validation,
        } => capture(config, facing, out, skip_validation, &cancel).await,
        Commands::Validate { file } => until_cancelled(&cancel, validate(&config, &file)).await,
        Commands::Dresses => until_cancelled(&cancel, dresses(&config)).await,
        Commands::TryOn {
            photo,
            garment,
            strategy,
        } => try_on(config, photo, garment, strategy, &cancel).await,
        Commands::Watch {
            session_id,
            strategy,
        } => watch(config, &session_id, strategy, &cancel).await,
        Commands::SeedCatalog { dir } => until_cancelled(&cancel, seed_catalog(&config, &dir)).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// Runs `work` unless Ctrl-C arrives first; `None` means it was cancelled.
async fn cancellable<T, F>(cancel: &CancellationToken, work: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            println!("Cancelled");
            Ok(None)
        }
        result = work => result.map(Some),
    }
}

async fn until_cancelled<F>(cancel: &CancellationToken, work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    cancellable(cancel, work).await.map(|_| ())
}

fn init_config(path: Option<&Path>, preset: Preset, force: bool) -> Result<()> {
    let mut config = match preset {
        Preset::Default => Config::default(),
        Preset::Desktop => Config::development_desktop(),
        Preset::Kiosk => Config::kiosk(),
    };
    if let Some(path) = path {
        config.paths.config_file = path.to_path_buf();
    }
    if config.paths.config_file.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            config.paths.config_file.display()
        );
    }
    config.save()?;
    println!("Wrote {}", config.paths.config_file.display());
    Ok(())
}

fn media_devices(config: &Config) -> Arc<dyn MediaDevices> {
    match config.camera.backend {
        CameraBackendKind::Virtual => Arc::new(VirtualDevices::new()),
        CameraBackendKind::Rpicam => {
            let devices = RpicamDevices::detect(&config.paths.preview_dir);
            if devices.is_supported() {
                Arc::new(devices)
            } else {
                log::warn!("Camera not available - using test pattern camera");
                Arc::new(VirtualDevices::new())
            }
        }
    }
}

fn photo_validator(config: &Config) -> PhotoValidator {
    let client = VisionClient::from_config(&config.validation, Config::vision_key());
    PhotoValidator::from_config(Arc::new(client), &config.validation)
}

fn supabase(config: &Config) -> Result<Arc<SupabaseBackend>> {
    let key = Config::backend_key()?;
    Ok(Arc::new(SupabaseBackend::new(&config.backend, key)))
}

async fn capture(
    mut config: Config,
    facing: Option<Facing>,
    out: Option<PathBuf>,
    skip_validation: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(facing) = facing {
        config.camera.default_facing = facing.into();
    }
    let mut session = CaptureSession::new(
        media_devices(&config),
        PreviewRegistry::new(),
        config.camera.clone(),
    );

    let started = tokio::select! {
        result = session.start() => Some(result),
        _ = cancel.cancelled() => None,
    };
    match started {
        Some(result) => result?,
        None => {
            session.cancel();
            println!("Cancelled");
            return Ok(());
        }
    }

    let photo = session.capture()?;
    if !skip_validation {
        let validator = photo_validator(&config);
        let validated = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = validator.validate(&photo.file) => Some(result),
        };
        let Some(result) = validated else {
            session.cancel();
            println!("Cancelled");
            return Ok(());
        };
        if !result.is_valid {
            session.discard_capture();
            println!("Photo rejected: {}", result.reason.unwrap_or_default());
            return Ok(());
        }
    }

    config.create_directories()?;
    let path = out.unwrap_or_else(|| config.paths.capture_dir.join(&photo.file.name));
    std::fs::write(&path, &photo.file.bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Saved {} ({} bytes)", path.display(), photo.file.len());
    Ok(())
}

async fn validate(config: &Config, file: &Path) -> Result<()> {
    let photo = PhotoLoader::new(&config.upload).load(file)?;
    let result = photo_validator(config).validate(&photo).await;
    match result.reason {
        None => println!("{}: valid", file.display()),
        Some(reason) => println!("{}: invalid ({})", file.display(), reason),
    }
    Ok(())
}

async fn dresses(config: &Config) -> Result<()> {
    let backend = supabase(config)?;
    let dresses = backend.list().await?;
    if dresses.is_empty() {
        println!("No dresses in the catalog");
    }
    for dress in dresses {
        println!("{}\t{}\t{}", dress.id, dress.name, dress.image_url);
    }
    Ok(())
}

async fn garment_choice(
    config: &Config,
    backend: &SupabaseBackend,
    source: GarmentSource,
) -> Result<GarmentChoice> {
    if let Some(wanted) = source.dress {
        let dress = backend
            .list()
            .await?
            .into_iter()
            .find(|d| d.id == wanted || d.name.eq_ignore_ascii_case(&wanted))
            .with_context(|| format!("No catalog dress called {}", wanted))?;
        return Ok(GarmentChoice::Catalog(dress));
    }
    if let Some(url) = source.dress_url {
        return Ok(GarmentChoice::Url(url));
    }
    let path = source
        .dress_file
        .context("Choose a dress with --dress, --dress-url or --dress-file")?;
    Ok(GarmentChoice::Upload(PhotoLoader::new(&config.upload).load(path)?))
}

async fn try_on(
    mut config: Config,
    photo: PhotoSource,
    garment: GarmentSource,
    strategy: Option<Strategy>,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(strategy) = strategy {
        config.observe.strategy = strategy.into();
    }
    let backend = supabase(&config)?;
    let Some(garment) = cancellable(cancel, garment_choice(&config, &backend, garment)).await? else {
        return Ok(());
    };

    let notifier = Arc::new(LogNotifier { echo: true });
    let sessions: Arc<dyn SessionStore> = backend.clone();
    let observer = observer_for(
        &config.observe,
        &config.backend,
        Arc::clone(&sessions),
        Config::backend_key()?,
    );
    let flow = TryOnFlow::new(backend.clone(), sessions, Arc::from(observer), notifier.clone());
    let capture = CaptureSession::new(
        media_devices(&config),
        PreviewRegistry::new(),
        config.camera.clone(),
    );
    let mut booth = TryOnBooth::new(capture, photo_validator(&config), flow, notifier);

    let accepted = match photo.photo {
        Some(path) => {
            let file = PhotoLoader::new(&config.upload).load(path)?;
            booth.accept_upload(file, cancel).await
        }
        None => booth.capture_and_validate(cancel).await.map(|_| ()),
    };
    match accepted {
        Ok(()) => {}
        Err(TryOnError::Session(SessionError::Cancelled)) => {
            println!("Cancelled");
            booth.shutdown();
            return Ok(());
        }
        Err(TryOnError::Rejected(reason)) => {
            println!("Photo rejected: {}", reason);
            booth.shutdown();
            return Ok(());
        }
        Err(e) => {
            booth.shutdown();
            return Err(e.into());
        }
    }

    let outcome = booth.submit_accepted(garment, cancel).await;
    booth.shutdown();

    match outcome {
        Ok(outcome) => print_outcome(&outcome),
        Err(TryOnError::Session(SessionError::Cancelled)) => {
            println!("Cancelled");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn print_outcome(outcome: &TryOnOutcome) {
    match outcome {
        TryOnOutcome::Completed { session, result_url } => {
            println!("Session {} completed: {}", session.id, result_url)
        }
        TryOnOutcome::Failed { session, message } => {
            println!("Session {} failed: {}", session.id, message)
        }
    }
}

async fn watch(
    mut config: Config,
    session_id: &str,
    strategy: Option<Strategy>,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(strategy) = strategy {
        config.observe.strategy = strategy.into();
    }
    let backend = supabase(&config)?;
    let observer = observer_for(
        &config.observe,
        &config.backend,
        backend,
        Config::backend_key()?,
    );

    let observed = observer
        .observe(session_id, cancel, &mut |update: &TryOnSession| {
            println!("{}: {:?}", update.id, update.status);
        })
        .await;
    let session = match observed {
        Ok(session) => session,
        Err(SessionError::Cancelled) => {
            println!("Cancelled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match (&session.result_image_url, &session.result_message) {
        (Some(url), _) => println!("Result: {}", url),
        (None, Some(message)) => println!("Message: {}", message),
        (None, None) => {}
    }
    Ok(())
}

async fn seed_catalog(config: &Config, dir: &Path) -> Result<()> {
    let backend = supabase(config)?;
    let loader = PhotoLoader::new(&config.upload);

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    let mut seeded = 0;
    for path in entries {
        let photo = match loader.load(&path) {
            Ok(photo) => photo,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = catalog_name(&stem);

        let url = backend
            .upload(&format!("dress-options/{}", photo.name), &photo, true)
            .await?;
        let updated = backend.set_image_url(&name, &url).await?;
        if updated == 0 {
            log::warn!("No catalog entry named {} for {}", name, path.display());
        } else {
            seeded += 1;
            println!("{} -> {}", name, url);
        }
    }

    println!("Seeded {} catalog image(s)", seeded);
    Ok(())
}
