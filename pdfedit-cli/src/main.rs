use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use parking_lot::Mutex;
use pdfedit_core::{
    AnnotationBlob, AnnotationCanvas, CloseDecision, DocumentModel, EditorConfig, EditorHost,
    RasterEngine, RenderOutcome, RenderSurface, RenderedFrame, SessionRegistry, Workbench,
};
use pdfedit_render::PdfiumEngine;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pdfedit", version, about = "Page-level PDF editing")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// pdfium shared library to bind
    #[arg(long, global = true)]
    pdfium: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print page count, sizes and rotations as JSON
    Info { input: PathBuf },
    /// Delete a page (1-based)
    Delete {
        input: PathBuf,
        #[arg(short, long)]
        page: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Insert a copy of a page right after it
    Duplicate {
        input: PathBuf,
        #[arg(short, long)]
        page: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Insert a blank page after the given page (0 = at the front)
    InsertBlank {
        input: PathBuf,
        #[arg(short, long)]
        after: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Move a page to a new position
    Move {
        input: PathBuf,
        #[arg(long)]
        from: usize,
        #[arg(long)]
        to: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rotate a page by a multiple of 90 degrees
    Rotate {
        input: PathBuf,
        #[arg(short, long)]
        page: usize,
        #[arg(short, long, allow_hyphen_values = true)]
        degrees: i32,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Append the pages of other documents
    Merge {
        input: PathBuf,
        #[arg(required = true)]
        others: Vec<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Extract pages such as "1-3,5" into a new document
    Split {
        input: PathBuf,
        #[arg(short, long)]
        pages: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Render one page to PNG
    Render {
        input: PathBuf,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        #[arg(short, long, default_value_t = 1.0)]
        scale: f32,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Render every page as a thumbnail PNG (page-N.png)
    Thumbnails {
        input: PathBuf,
        /// Thumbnail width in pixels (defaults to the configured width)
        #[arg(short, long)]
        width: Option<f32>,
        #[arg(short, long)]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = EditorConfig::project_dirs()?;
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => EditorConfig::default_path()?,
    };
    let mut config = EditorConfig::load(&config_path)?;
    if let Command::Thumbnails { width: Some(width), .. } = &args.command {
        if !(*width > 0.0) {
            bail!("thumbnail width must be positive, got {width}");
        }
        config.thumbnail_width = *width;
    }
    let _log_guard = init_logging(&project_dirs, &config.log_filter)?;

    let engine = Arc::new(PdfiumEngine::new(args.pdfium.as_deref())?);
    let surface = Arc::new(FrameCapture::default());
    let raster: Arc<dyn RasterEngine> = engine.clone();
    let model: Arc<dyn DocumentModel> = engine;
    let workbench = Workbench::new(
        raster,
        model,
        Arc::new(NoAnnotations),
        surface.clone(),
        config,
    );
    let mut registry = SessionRegistry::new(workbench);

    run(&mut registry, &surface, args.command).await
}

async fn run(registry: &mut SessionRegistry, surface: &FrameCapture, command: Command) -> Result<()> {
    match command {
        Command::Info { input } => {
            let id = open(registry, &input).await?;
            let session = registry
                .session(id)
                .ok_or_else(|| anyhow!("session vanished after open"))?;
            let document = &session.snapshot().document;
            let mut pages = Vec::new();
            for index in 0..document.page_count() {
                let size = document.page_size(index)?;
                let rotation = document.rotation(index)?;
                pages.push(serde_json::json!({
                    "page": index + 1,
                    "width": size.width,
                    "height": size.height,
                    "rotation": rotation.degrees(),
                }));
            }
            let report = serde_json::json!({
                "name": session.name,
                "page_count": document.page_count(),
                "pages": pages,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Delete { input, page, output } => {
            open(registry, &input).await?;
            registry.delete_page(page).await?;
            save(registry, output).await
        }
        Command::Duplicate { input, page, output } => {
            open(registry, &input).await?;
            registry.duplicate_page(page).await?;
            save(registry, output).await
        }
        Command::InsertBlank { input, after, output } => {
            open(registry, &input).await?;
            registry.insert_blank_page(after).await?;
            save(registry, output).await
        }
        Command::Move { input, from, to, output } => {
            open(registry, &input).await?;
            registry.move_page(from, to).await?;
            save(registry, output).await
        }
        Command::Rotate {
            input,
            page,
            degrees,
            output,
        } => {
            if degrees % 90 != 0 {
                bail!("rotation must be a multiple of 90 degrees, got {degrees}");
            }
            open(registry, &input).await?;
            registry.go_to_page(page).await?;
            registry.rotate_page(degrees).await?;
            save(registry, output).await
        }
        Command::Merge {
            input,
            others,
            output,
        } => {
            open(registry, &input).await?;
            let mut inputs = Vec::with_capacity(others.len());
            for path in &others {
                inputs.push(fs::read(path).with_context(|| format!("failed to read {:?}", path))?);
            }
            registry.merge(&inputs).await?;
            save(registry, output).await
        }
        Command::Split {
            input,
            pages,
            output,
        } => {
            open(registry, &input).await?;
            let split = registry.split(&pages).await?;
            write_atomic(&output, &split.bytes)?;
            info!(pages = ?split.pages, output = %output.display(), "split written");
            Ok(())
        }
        Command::Render {
            input,
            page,
            scale,
            output,
        } => {
            open(registry, &input).await?;
            registry.set_scale(scale).await?;
            match registry.go_to_page(page).await? {
                RenderOutcome::Presented { .. } => surface.write_png(&output),
                other => Err(anyhow!("page {page} was not rendered: {other:?}")),
            }
        }
        Command::Thumbnails {
            input, output_dir, ..
        } => {
            open(registry, &input).await?;
            let page_count = registry.workbench().page_count();
            let frames = registry.render_thumbnails().await?;
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("failed to create directory {:?}", output_dir))?;
            let written = frames.len();
            for frame in frames {
                let path = output_dir.join(format!("page-{}.png", frame.page));
                write_frame_png(frame, &path)?;
            }
            if written < page_count {
                warn!(written, page_count, "some thumbnails could not be rendered");
            }
            info!(written, output = %output_dir.display(), "thumbnails written");
            Ok(())
        }
    }
}

async fn open(registry: &mut SessionRegistry, path: &Path) -> Result<pdfedit_core::SessionId> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let name = pdfedit_core::session::display_name(path);
    let id = registry
        .open_document(name, Some(path.to_path_buf()), bytes)
        .await
        .with_context(|| format!("failed to open {:?}", path))?;
    Ok(id)
}

async fn save(registry: &mut SessionRegistry, output: Option<PathBuf>) -> Result<()> {
    let host = FileHost { output };
    if !registry.save(&host).await? {
        bail!("document was not written");
    }
    if let Some(session) = registry.active() {
        info!(name = %session.name, path = ?session.path, "document written");
    }
    Ok(())
}

/// Writes documents to disk without prompting. Unsaved changes are always
/// saved since every command ends by writing its result.
struct FileHost {
    output: Option<PathBuf>,
}

#[async_trait]
impl EditorHost for FileHost {
    async fn confirm_unsaved(&self, display_name: &str) -> CloseDecision {
        info!(display_name, "saving unsaved changes");
        CloseDecision::Save
    }

    async fn write_document(&self, path: Option<&Path>, bytes: Vec<u8>) -> Result<Option<PathBuf>> {
        let Some(target) = self.output.as_deref().or(path) else {
            return Ok(None);
        };
        write_atomic(target, &bytes)?;
        Ok(Some(target.to_path_buf()))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {:?}", parent))?;
    }
    let tmp = path.with_extension("pdfedit.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}

/// The command line has no drawing layer; every page reads as unannotated.
struct NoAnnotations;

impl AnnotationCanvas for NoAnnotations {
    fn serialize_current_page(&self) -> Option<AnnotationBlob> {
        None
    }

    fn restore(&self, _blob: &AnnotationBlob) {}

    fn clear(&self) {}

    fn resize(&self, _width: f32, _height: f32) {}

    fn export_png(&self) -> Result<Vec<u8>> {
        Err(anyhow!("no annotation layer to export"))
    }
}

/// Keeps the most recent frame so `render` can write it out.
#[derive(Default)]
struct FrameCapture {
    last: Mutex<Option<RenderedFrame>>,
}

impl RenderSurface for FrameCapture {
    fn present(&self, frame: &RenderedFrame) {
        *self.last.lock() = Some(frame.clone());
    }
}

impl FrameCapture {
    fn write_png(&self, path: &Path) -> Result<()> {
        let frame = self
            .last
            .lock()
            .take()
            .ok_or_else(|| anyhow!("no frame has been rendered"))?;
        write_frame_png(frame, path)
    }
}

fn write_frame_png(frame: RenderedFrame, path: &Path) -> Result<()> {
    let page = frame.page;
    let image = frame.image;
    let buffer = image::RgbaImage::from_raw(image.width, image.height, image.pixels)
        .ok_or_else(|| anyhow!("rendered buffer does not match {}x{}", image.width, image.height))?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {:?}", path))?;
    info!(page, output = %path.display(), "page rendered");
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs, default_filter: &str) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pdfedit.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let mut rejected = None;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let (filter, err) = config_filter(default_filter);
        rejected = err;
        filter
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    // Only reported now that a subscriber exists to receive it.
    if let Some(err) = rejected {
        warn!(%err, default_filter, "invalid log filter in config; using info");
    }
    Ok(guard)
}

/// The configured filter, or `info` plus the parse error when the directive
/// is malformed.
fn config_filter(default_filter: &str) -> (EnvFilter, Option<String>) {
    match EnvFilter::try_new(default_filter) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new("info"), Some(err.to_string())),
    }
}
