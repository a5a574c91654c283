//! The `build` command: wrap an entrypoint binary into an OCI image.

use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{SecondsFormat, Utc};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use zeroimage_engine::archive;
use zeroimage_engine::error::{ImageError, Result};
use zeroimage_engine::image::{Image, Layer};
use zeroimage_engine::layer::LayerBuilder;
use zeroimage_engine::registry;
use zeroimage_engine::spec::{History, Platform};
use zeroimage_engine::tarbuild;

/// Build an image from an entrypoint binary.
#[derive(Args)]
pub struct BuildArgs {
    /// Path to the entrypoint binary
    pub entrypoint: PathBuf,

    /// Use an image from a remote registry as a base
    #[arg(long, conflicts_with = "from_archive")]
    pub from: Option<String>,

    /// Use an existing image archive as a base
    #[arg(long = "from-archive")]
    pub from_archive: Option<PathBuf>,

    /// Write the image archive to this path (default [ENTRYPOINT].tar)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Select the desired platform for the image (default: host platform)
    #[arg(long)]
    pub platform: Option<String>,

    /// Push the image to this tag in a remote registry instead of writing
    /// an archive
    #[arg(long, conflicts_with = "output")]
    pub push: Option<String>,
}

pub async fn execute(args: BuildArgs) -> Result<()> {
    let cancel = CancellationToken::new();

    let platform = match &args.platform {
        Some(platform) => Platform::parse(platform)?,
        None => Platform::host(),
    };

    let mut image = load_base_image(&args, &platform, &cancel).await?;

    let entrypoint_name = args
        .entrypoint
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            ImageError::SchemaViolation(format!(
                "entrypoint path {} has no usable file name",
                args.entrypoint.display()
            ))
        })?;
    let target_path = format!("/{entrypoint_name}");

    info!(entrypoint = %target_path, "adding entrypoint layer");
    image.append_layer(entrypoint_layer(&args.entrypoint, &target_path)?);

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    image.config.history.push(History {
        created: Some(now.clone()),
        created_by: Some("zeroimage".to_string()),
        comment: Some(format!("entrypoint: {target_path}")),
        ..History::default()
    });
    image.config.created = Some(now);
    let exec = image.config.config.get_or_insert_with(Default::default);
    exec.entrypoint = Some(vec![target_path]);
    exec.cmd = None;

    if let Some(reference) = &args.push {
        info!(reference = %reference, "pushing image to registry");
        return registry::push(&image, reference, &cancel).await;
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.entrypoint));
    info!(path = %output.display(), "writing image archive");
    let file = std::fs::File::create(&output)?;
    let mut sink = BufWriter::new(file);
    archive::write_image(&image, &cancel, &mut sink).await?;
    sink.flush()?;
    Ok(())
}

/// Resolve the base image: an archive, a registry reference, or an empty
/// from-scratch image for the requested platform.
async fn load_base_image(
    args: &BuildArgs,
    platform: &Platform,
    cancel: &CancellationToken,
) -> Result<Image> {
    let index = if let Some(path) = &args.from_archive {
        info!(path = %path.display(), "loading base image archive");
        let file = std::fs::File::open(path)?;
        archive::load(BufReader::new(file), cancel).await?
    } else if let Some(reference) = &args.from {
        info!(reference = %reference, "loading base image from registry");
        registry::load(reference, cancel).await?
    } else {
        let mut image = Image::default();
        image.set_platform(platform.clone());
        return Ok(image);
    };

    let selected = index.select_by_platform(platform);
    if selected.is_empty() {
        return Err(ImageError::NotFound(format!(
            "base image for platform {platform}"
        )));
    }
    if selected.len() > 1 {
        let matches: Vec<String> = selected
            .entries()
            .iter()
            .map(|entry| entry.platform.to_string())
            .collect();
        return Err(ImageError::SchemaViolation(format!(
            "cannot decide between multiple matches for {platform}: {}",
            matches.join(", ")
        )));
    }
    selected.entries()[0].get_image(cancel).await
}

/// Build the single-file layer holding the entrypoint binary, preserving
/// its size, mode, and modification time.
fn entrypoint_layer(path: &Path, target: &str) -> Result<Layer> {
    let file = std::fs::File::open(path)?;
    let metadata = file.metadata()?;
    let mod_time = metadata.modified().unwrap_or_else(|_| SystemTime::now());

    let mut builder = LayerBuilder::new();
    builder.add(
        target,
        tarbuild::File {
            reader: file,
            size: metadata.len(),
            mode: file_mode(&metadata),
            mod_time,
        },
    )?;
    builder.finish()
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o755
}

fn default_output(entrypoint: &Path) -> PathBuf {
    let mut name = entrypoint.as_os_str().to_os_string();
    name.push(".tar");
    PathBuf::from(name)
}
