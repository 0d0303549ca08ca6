use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use greeter_core::collaborators::FaceEmbedder;
use greeter_core::detector::SsdFaceDetector;
use greeter_core::matcher::IdentityIndex;
use greeter_core::recognizer::ArcFaceEmbedder;
use greeter_core::types::{crop_image, Embedding, FaceBox};
use greeter_hw::Camera;
use greeter_store::Store;
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Minimum face confidence for an enrollment photo.
const ENROLL_FACE_CONFIDENCE: f32 = 0.95;
/// Minimum face confidence when identifying a still.
const IDENTIFY_FACE_CONFIDENCE: f32 = 0.9;

#[derive(Parser)]
#[command(name = "greeter", about = "Greeter visitor management CLI")]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "GREETER_DB_PATH", global = true)]
    db: Option<PathBuf>,

    /// Directory containing the ONNX models
    #[arg(long, env = "GREETER_MODEL_DIR", global = true)]
    models: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a visitor from a photo containing exactly one face
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// List enrolled visitors
    Visitors,
    /// Remove an enrolled visitor
    Remove {
        /// Visitor ID to remove
        id: String,
    },
    /// List recent guest captures
    Guests {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Identify the most prominent face in a still image
    Identify {
        #[arg(short, long)]
        image: PathBuf,
        /// Maximum cosine distance for a match
        #[arg(long, env = "GREETER_DISTANCE_THRESHOLD")]
        threshold: f32,
    },
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(greeter_store::default_db_path);
    let model_dir = cli.models.unwrap_or_else(greeter_core::default_model_dir);

    match cli.command {
        Commands::Enroll { name, image } => {
            let store = open_store(&db_path)?;
            let photo = load_rgb(&image)?;
            let mut models = Models::load(&model_dir)?;
            let faces = models.faces.detect_all(&photo, ENROLL_FACE_CONFIDENCE)?;
            let face = single_face(&faces)?;
            let embedding = models.embed(&photo, face)?;
            let id = store.add_visitor(&name, &embedding)?;
            println!("Enrolled {name} as {id}");
        }
        Commands::Visitors => {
            let visitors = open_store(&db_path)?.list_visitors()?;
            if visitors.is_empty() {
                println!("No visitors enrolled");
            }
            for v in visitors {
                println!(
                    "{}  {:<24}  {}-d  {}",
                    v.id,
                    v.name,
                    v.dimensions,
                    v.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Remove { id } => {
            if open_store(&db_path)?.remove_visitor(&id)? {
                println!("Removed visitor {id}");
            } else {
                bail!("no visitor with id {id}");
            }
        }
        Commands::Guests { limit } => {
            let guests = open_store(&db_path)?.list_guests(limit)?;
            if guests.is_empty() {
                println!("No guest captures");
            }
            for g in guests {
                let who = g.visitor_id.map(|v| v.to_string()).unwrap_or_else(|| "guest".into());
                println!(
                    "{}  {}  {:>7} B  {:<36}  {}",
                    g.created_at.format("%Y-%m-%d %H:%M:%S"),
                    g.id,
                    g.image_bytes,
                    who,
                    g.greeting_text.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Identify { image, threshold } => {
            let store = open_store(&db_path)?;
            let gallery = store.load_gallery()?;
            let photo = load_rgb(&image)?;
            let mut models = Models::load(&model_dir)?;
            let faces = models.faces.detect_all(&photo, IDENTIFY_FACE_CONFIDENCE)?;
            let Some(face) = faces.first() else {
                bail!("no face found in {}", image.display());
            };
            let embedding = models.embed(&photo, face)?;

            match gallery.nearest(&embedding) {
                Some(n) if n.distance <= threshold => {
                    println!("Match: {} ({}) distance {:.4}", n.name, n.visitor_id, n.distance);
                }
                Some(n) => {
                    println!(
                        "Unknown: nearest {} at distance {:.4} (threshold {threshold})",
                        n.name, n.distance
                    );
                }
                None => println!("Unknown: no visitors enrolled"),
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {}  ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

struct Models {
    faces: SsdFaceDetector,
    embedder: ArcFaceEmbedder,
}

impl Models {
    fn load(dir: &Path) -> Result<Self> {
        let face_path = dir.join(greeter_core::FACE_MODEL_FILE);
        let embed_path = dir.join(greeter_core::EMBEDDING_MODEL_FILE);
        tracing::debug!(dir = %dir.display(), "loading face models");
        Ok(Self {
            faces: SsdFaceDetector::load(&face_path.to_string_lossy(), IDENTIFY_FACE_CONFIDENCE)
                .context("loading face detector")?,
            embedder: ArcFaceEmbedder::load(&embed_path.to_string_lossy())
                .context("loading face embedder")?,
        })
    }

    fn embed(&mut self, photo: &RgbImage, face: &FaceBox) -> Result<Embedding> {
        let crop = crop_image(photo, &face.rect).context("face box is empty")?;
        Ok(self.embedder.embed(&crop)?)
    }
}

fn open_store(path: &Path) -> Result<Store> {
    Store::open(path).with_context(|| format!("failed to open store at {}", path.display()))
}

fn load_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8())
}

/// Enrollment photos must contain exactly one confident face.
fn single_face(faces: &[FaceBox]) -> Result<&FaceBox> {
    match faces {
        [face] => Ok(face),
        [] => bail!("no face found above confidence {ENROLL_FACE_CONFIDENCE}"),
        many => bail!(
            "{} faces found above confidence {ENROLL_FACE_CONFIDENCE}; use a photo with exactly one face",
            many.len()
        ),
    }
}
