use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::sync::broadcast;
use walkdir::WalkDir;

use photosift_core::{
    AssetDescriptor, AssetId, AssetSource, ChangeSet, Error, MediaType, Result, Scope,
};

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "webp", "heic", "heif", "dng"];
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "m4v", "avi"];

/// Asset source over a directory tree. Ids are paths relative to the root.
pub struct DirectorySource {
    root: PathBuf,
    assets: Vec<AssetDescriptor>,
    paths: HashMap<AssetId, PathBuf>,
    changes: broadcast::Sender<ChangeSet>,
}

impl DirectorySource {
    /// Walk `root` once and describe every media file under it.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::SourceUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let root = root.canonicalize()?;

        let mut assets = Vec::new();
        let mut paths = HashMap::new();
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let Some(media_type) = media_type_of(path) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let id = path
                .strip_prefix(&root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let file_name = entry.file_name().to_string_lossy().to_string();
            let mtime: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let (pixel_width, pixel_height) = match media_type {
                MediaType::Video => (0, 0),
                _ => image::image_dimensions(path).unwrap_or((0, 0)),
            };

            assets.push(AssetDescriptor {
                id: id.clone(),
                capture_date: read_capture_date(path).unwrap_or(mtime),
                byte_size: metadata.len(),
                pixel_width,
                pixel_height,
                media_type,
                is_screenshot: is_screenshot_name(&file_name),
                file_name,
                album_name: album_of(&id),
            });
            paths.insert(id, path.to_path_buf());
        }

        assets.sort_by(|a, b| {
            b.capture_date
                .cmp(&a.capture_date)
                .then_with(|| a.id.cmp(&b.id))
        });

        let (changes, _) = broadcast::channel(16);
        Ok(Self {
            root,
            assets,
            paths,
            changes,
        })
    }

    /// A source with nothing in it, for commands that only read the catalog.
    pub fn empty() -> Self {
        let (changes, _) = broadcast::channel(1);
        Self {
            root: PathBuf::new(),
            assets: Vec::new(),
            paths: HashMap::new(),
            changes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn path_of(&self, id: &str) -> Option<&Path> {
        self.paths.get(id).map(PathBuf::as_path)
    }
}

#[async_trait]
impl AssetSource for DirectorySource {
    async fn enumerate(
        &self,
        scope: Scope,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AssetDescriptor>> {
        Ok(self
            .assets
            .iter()
            .filter(|a| scope.contains(a.capture_date))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn describe(&self, ids: &[AssetId]) -> Result<Vec<AssetDescriptor>> {
        Ok(self
            .assets
            .iter()
            .filter(|a| ids.contains(&a.id))
            .cloned()
            .collect())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }
}

fn media_type_of(path: &Path) -> Option<MediaType> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if ext == "gif" {
        Some(MediaType::Gif)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Video)
    } else if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Photo)
    } else {
        None
    }
}

fn is_screenshot_name(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.starts_with("screenshot") || lower.starts_with("screen shot")
}

/// Parent directory of a relative id, if it has one.
fn album_of(id: &str) -> Option<String> {
    let (dir, _) = id.rsplit_once('/')?;
    dir.rsplit('/').next().map(str::to_string)
}

/// `DateTimeOriginal` from EXIF, read as UTC.
fn read_capture_date(path: &Path) -> Option<DateTime<Utc>> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif
        .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
        .or_else(|| exif.get_field(exif::Tag::DateTime, exif::In::PRIMARY))?;
    let exif::Value::Ascii(ref values) = field.value else {
        return None;
    };
    let dt = exif::DateTime::from_ascii(values.first()?).ok()?;
    let naive = NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)?
        .and_hms_opt(dt.hour as u32, dt.minute as u32, dt.second as u32)?;
    Utc.from_local_datetime(&naive).single()
}
