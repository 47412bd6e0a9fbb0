//! Tree-level image conversion and reference rewriting.
//!
//! `TransformEngine::transform` walks a working tree in two passes:
//!
//! 1. **Assets**: every qualifying image is handed to the [`Converter`]; the
//!    output lands next to the input and the original is deleted.
//! 2. **Markup**: every qualifying text file is scanned for references to
//!    qualifying images; references whose target was converted are rewritten
//!    to the `.webp` output and the file is saved only if something changed.
//!
//! Failures are per file and end up in [`TransformationResult::errors`]; the
//! walk never aborts because one file is bad.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::{Captures, Regex};
use serde::Serialize;
use walkdir::WalkDir;

use crate::errors::ConversionError;

/// Extension every converted asset ends up with.
pub const OUTPUT_EXTENSION: &str = "webp";

/// Opaque asset conversion: reads `input`, writes the converted file next to
/// it and returns the output path. Must not delete `input`.
pub trait Converter: Send + Sync {
    fn convert(&self, input: &Path) -> Result<PathBuf, ConversionError>;
}

/// Decodes JPEG/PNG with `image` and re-encodes as WebP.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebpConverter;

impl Converter for WebpConverter {
    fn convert(&self, input: &Path) -> Result<PathBuf, ConversionError> {
        let output = input.with_extension(OUTPUT_EXTENSION);
        let img = image::open(input).map_err(|e| match e {
            image::ImageError::IoError(source) => ConversionError::Io {
                path: input.to_path_buf(),
                source,
            },
            image::ImageError::Unsupported(_) => ConversionError::Unsupported {
                path: input.to_path_buf(),
            },
            other => ConversionError::Decode {
                path: input.to_path_buf(),
                message: other.to_string(),
            },
        })?;

        // The WebP encoder takes 8-bit buffers only
        let rgba = image::DynamicImage::ImageRgba8(img.to_rgba8());
        if let Err(e) = rgba.save_with_format(&output, image::ImageFormat::WebP) {
            let _ = std::fs::remove_file(&output);
            return Err(ConversionError::Encode {
                path: output,
                message: e.to_string(),
            });
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertedAsset {
    pub source: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformError {
    pub path: PathBuf,
    pub cause: String,
}

/// Outcome of one `transform` call. Paths are relative to the walked root and
/// listed in walk order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformationResult {
    pub converted: Vec<ConvertedAsset>,
    pub rewritten: Vec<PathBuf>,
    /// Originals left alone because their output already exists.
    pub skipped: Vec<PathBuf>,
    pub errors: Vec<TransformError>,
}

impl TransformationResult {
    pub fn files_converted(&self) -> impl Iterator<Item = &Path> {
        self.converted.iter().map(|c| c.source.as_path())
    }

    /// True when the tree differs from what was walked.
    pub fn has_changes(&self) -> bool {
        !self.converted.is_empty() || !self.rewritten.is_empty()
    }

    fn record_error(&mut self, root: &Path, path: &Path, cause: impl ToString) {
        let cause = cause.to_string();
        tracing::warn!(path = %path.display(), %cause, "transform error");
        self.errors.push(TransformError {
            path: relative(root, path),
            cause,
        });
    }
}

pub struct TransformEngine {
    converter: Arc<dyn Converter>,
    image_extensions: Vec<String>,
    markup_extensions: Vec<String>,
    reference_re: Regex,
}

impl TransformEngine {
    pub fn new(
        converter: Arc<dyn Converter>,
        image_extensions: &[String],
        markup_extensions: &[String],
    ) -> Self {
        let image_extensions: Vec<String> =
            image_extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        let markup_extensions: Vec<String> =
            markup_extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        let reference_re = reference_regex(&image_extensions);
        Self {
            converter,
            image_extensions,
            markup_extensions,
            reference_re,
        }
    }

    /// Engine with the `WebpConverter` and the given extension lists.
    pub fn webp(image_extensions: &[String], markup_extensions: &[String]) -> Self {
        Self::new(Arc::new(WebpConverter), image_extensions, markup_extensions)
    }

    /// Walk `root`, convert assets, rewrite references. Blocking; call from
    /// `spawn_blocking` in async contexts.
    pub fn transform(&self, root: &Path) -> TransformationResult {
        let mut result = TransformationResult::default();
        let mut assets = Vec::new();
        let mut markup = Vec::new();

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == ".git"));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    result.record_error(root, &path, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            match extension_of(&path) {
                Some(ext) if self.image_extensions.contains(&ext) => assets.push(path),
                Some(ext) if self.markup_extensions.contains(&ext) => markup.push(path),
                _ => {}
            }
        }

        for asset in &assets {
            self.convert_asset(root, asset, &mut result);
        }
        for file in &markup {
            self.rewrite_references(root, file, &mut result);
        }

        tracing::info!(
            root = %root.display(),
            converted = result.converted.len(),
            rewritten = result.rewritten.len(),
            skipped = result.skipped.len(),
            errors = result.errors.len(),
            "transform finished"
        );
        result
    }

    fn convert_asset(&self, root: &Path, input: &Path, result: &mut TransformationResult) {
        let expected = input.with_extension(OUTPUT_EXTENSION);
        if expected.exists() {
            tracing::debug!(path = %input.display(), "output already exists, skipping");
            result.skipped.push(relative(root, input));
            return;
        }

        let output = match self.converter.convert(input) {
            Ok(output) => output,
            Err(e) => {
                result.record_error(root, input, e);
                return;
            }
        };
        if let Err(e) = std::fs::remove_file(input) {
            result.record_error(root, input, format!("converted but failed to delete original: {}", e));
            return;
        }
        tracing::debug!(from = %input.display(), to = %output.display(), "converted");
        result.converted.push(ConvertedAsset {
            source: relative(root, input),
            output: relative(root, &output),
        });
    }

    fn rewrite_references(&self, root: &Path, file: &Path, result: &mut TransformationResult) {
        let content = match std::fs::read_to_string(file) {
            Ok(content) => content,
            Err(e) => {
                result.record_error(root, file, e);
                return;
            }
        };
        let base_dir = file.parent().unwrap_or(root);

        let mut changed = false;
        let updated = self.reference_re.replace_all(&content, |caps: &Captures| {
            let reference = &caps[1];
            let delimiter = caps.get(2).map_or("", |m| m.as_str());
            match resolve_reference(root, base_dir, reference) {
                Some(target) if !target.exists() && target.with_extension(OUTPUT_EXTENSION).exists() => {
                    changed = true;
                    format!("{}{}", swap_extension(reference), delimiter)
                }
                _ => caps[0].to_string(),
            }
        });

        if !changed {
            return;
        }
        if let Err(e) = std::fs::write(file, updated.as_bytes()) {
            result.record_error(root, file, e);
            return;
        }
        tracing::debug!(path = %file.display(), "rewrote image references");
        result.rewritten.push(relative(root, file));
    }
}

/// Path token ending in one of `extensions`, followed by a quote, a closing
/// parenthesis, whitespace, a comma, `>` or the end of the text. Covers
/// `srcset` candidate lists and Markdown image titles.
fn reference_regex(extensions: &[String]) -> Regex {
    let alternation = if extensions.is_empty() {
        // Matches nothing: an extension can't contain a quote
        "\"\"".to_string()
    } else {
        extensions
            .iter()
            .map(|e| regex::escape(e))
            .collect::<Vec<_>>()
            .join("|")
    };
    let pattern = format!(r#"([^"'()\s<>,=]+\.(?i:{}))(["')\s,>]|$)"#, alternation);
    Regex::new(&pattern).expect("reference pattern is built from escaped literals")
}

fn resolve_reference(root: &Path, base_dir: &Path, reference: &str) -> Option<PathBuf> {
    if reference.contains("://") || reference.starts_with("//") || reference.starts_with("data:") {
        return None;
    }
    match reference.strip_prefix('/') {
        Some(rooted) => Some(root.join(rooted)),
        None => Some(base_dir.join(reference)),
    }
}

fn swap_extension(reference: &str) -> String {
    match reference.rfind('.') {
        Some(dot) => format!("{}.{}", &reference[..dot], OUTPUT_EXTENSION),
        None => reference.to_string(),
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn relative(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    /// Writes a marker file instead of encoding; fails for names containing "broken".
    struct StubConverter {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl StubConverter {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Converter for StubConverter {
        fn convert(&self, input: &Path) -> Result<PathBuf, ConversionError> {
            self.calls.lock().unwrap().push(input.to_path_buf());
            if input.to_string_lossy().contains("broken") {
                return Err(ConversionError::Decode {
                    path: input.to_path_buf(),
                    message: "corrupt header".into(),
                });
            }
            let output = input.with_extension(OUTPUT_EXTENSION);
            fs::write(&output, b"RIFFWEBP").map_err(|source| ConversionError::Io {
                path: output.clone(),
                source,
            })?;
            Ok(output)
        }
    }

    fn exts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn stub_engine() -> (TransformEngine, Arc<StubConverter>) {
        let converter = Arc::new(StubConverter::new());
        let engine = TransformEngine::new(
            converter.clone(),
            &exts(&["jpg", "jpeg", "png"]),
            &exts(&["html", "jsx", "css", "md"]),
        );
        (engine, converter)
    }

    #[test]
    fn test_converts_image_and_rewrites_reference() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"jpeg").unwrap();
        fs::write(dir.path().join("page.html"), r#"<img src="a.jpg">"#).unwrap();

        let (engine, _) = stub_engine();
        let result = engine.transform(dir.path());

        assert!(!dir.path().join("a.jpg").exists());
        assert!(dir.path().join("a.webp").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("page.html")).unwrap(),
            r#"<img src="a.webp">"#
        );
        assert_eq!(result.files_converted().collect::<Vec<_>>(), vec![Path::new("a.jpg")]);
        assert_eq!(result.converted[0].output, PathBuf::from("a.webp"));
        assert_eq!(result.rewritten, vec![PathBuf::from("page.html")]);
        assert!(result.errors.is_empty());
        assert!(result.has_changes());
    }

    #[test]
    fn test_real_webp_conversion() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::from_pixel(4, 4, image::Rgb([200, 10, 10]))
            .save(dir.path().join("a.jpg"))
            .unwrap();
        image::RgbaImage::from_pixel(3, 2, image::Rgba([0, 0, 255, 128]))
            .save(dir.path().join("b.png"))
            .unwrap();
        fs::write(
            dir.path().join("page.html"),
            r#"<img src="a.jpg"><img src='b.png'>"#,
        )
        .unwrap();

        let engine = TransformEngine::webp(&exts(&["jpg", "png"]), &exts(&["html"]));
        let result = engine.transform(dir.path());

        assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
        assert_eq!(result.converted.len(), 2);
        let decoded = image::open(dir.path().join("a.webp")).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 4));
        assert!(dir.path().join("b.webp").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("page.html")).unwrap(),
            r#"<img src="a.webp"><img src='b.webp'>"#
        );
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("img/logo.png"), b"png").unwrap();
        fs::write(
            dir.path().join("App.jsx"),
            "import logo from './img/logo.png';\n",
        )
        .unwrap();

        let (engine, converter) = stub_engine();
        let first = engine.transform(dir.path());
        assert_eq!(first.converted.len(), 1);
        assert_eq!(first.rewritten.len(), 1);

        let second = engine.transform(dir.path());
        assert!(second.converted.is_empty());
        assert!(second.rewritten.is_empty());
        assert!(second.errors.is_empty());
        assert!(!second.has_changes());
        assert_eq!(converter.calls.lock().unwrap().len(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("App.jsx")).unwrap(),
            "import logo from './img/logo.webp';\n"
        );
    }

    #[test]
    fn test_existing_output_is_skipped_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"png").unwrap();
        fs::write(dir.path().join("a.webp"), b"hand-tuned").unwrap();

        let (engine, converter) = stub_engine();
        let result = engine.transform(dir.path());

        assert_eq!(result.skipped, vec![PathBuf::from("a.png")]);
        assert!(result.converted.is_empty());
        assert!(dir.path().join("a.png").exists());
        assert_eq!(fs::read(dir.path().join("a.webp")).unwrap(), b"hand-tuned");
        assert!(converter.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failure_is_recorded_and_walk_continues() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.jpg"), b"??").unwrap();
        fs::write(dir.path().join("ok.jpg"), b"jpeg").unwrap();
        fs::write(
            dir.path().join("index.html"),
            r#"<img src="broken.jpg"><img src="ok.jpg">"#,
        )
        .unwrap();

        let (engine, _) = stub_engine();
        let result = engine.transform(dir.path());

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, PathBuf::from("broken.jpg"));
        assert!(result.errors[0].cause.contains("corrupt header"));
        assert_eq!(result.converted.len(), 1);
        // The reference to the failed asset must keep pointing at the original
        assert_eq!(
            fs::read_to_string(dir.path().join("index.html")).unwrap(),
            r#"<img src="broken.jpg"><img src="ok.webp">"#
        );
        assert!(dir.path().join("broken.jpg").exists());
    }

    #[test]
    fn test_remote_and_missing_references_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let html = r#"<img src="https://cdn.example.com/a.jpg"><img src="missing.png">"#;
        fs::write(dir.path().join("page.html"), html).unwrap();

        let (engine, _) = stub_engine();
        let result = engine.transform(dir.path());

        assert!(result.rewritten.is_empty());
        assert_eq!(fs::read_to_string(dir.path().join("page.html")).unwrap(), html);
    }

    #[test]
    fn test_root_relative_and_nested_references() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("static")).unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("static/Hero.JPG"), b"jpeg").unwrap();
        fs::write(
            dir.path().join("docs/guide.md"),
            "![hero](/static/Hero.JPG)\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("docs/site.css"),
            "body { background: url('../static/Hero.JPG'); }\n",
        )
        .unwrap();

        let (engine, _) = stub_engine();
        let result = engine.transform(dir.path());

        assert_eq!(result.converted.len(), 1);
        assert_eq!(
            result.rewritten,
            vec![PathBuf::from("docs/guide.md"), PathBuf::from("docs/site.css")]
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("docs/guide.md")).unwrap(),
            "![hero](/static/Hero.webp)\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("docs/site.css")).unwrap(),
            "body { background: url('../static/Hero.webp'); }\n"
        );
    }

    #[test]
    fn test_srcset_candidates_are_all_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"jpeg").unwrap();
        fs::write(dir.path().join("b.jpg"), b"jpeg").unwrap();
        fs::write(
            dir.path().join("page.html"),
            r#"<img srcset="a.jpg 1x, b.jpg 2x" src="b.jpg">"#,
        )
        .unwrap();

        let (engine, _) = stub_engine();
        let result = engine.transform(dir.path());

        assert_eq!(result.files_converted().count(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("page.html")).unwrap(),
            r#"<img srcset="a.webp 1x, b.webp 2x" src="b.webp">"#
        );
    }

    #[test]
    fn test_markdown_image_with_title_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"jpeg").unwrap();
        fs::write(dir.path().join("doc.md"), "![hero](a.jpg \"Hero\")\nSee a.jpg.\n").unwrap();

        let (engine, _) = stub_engine();
        engine.transform(dir.path());

        // Prose mentions without a delimiter stay as written
        assert_eq!(
            fs::read_to_string(dir.path().join("doc.md")).unwrap(),
            "![hero](a.webp \"Hero\")\nSee a.jpg.\n"
        );
    }

    #[test]
    fn test_reference_at_end_of_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"png").unwrap();
        fs::write(dir.path().join("list.md"), "hero: a.png").unwrap();

        let (engine, _) = stub_engine();
        engine.transform(dir.path());

        assert_eq!(fs::read_to_string(dir.path().join("list.md")).unwrap(), "hero: a.webp");
    }

    #[test]
    fn test_git_directory_is_not_walked() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/objects/x.png"), b"png").unwrap();

        let (engine, converter) = stub_engine();
        let result = engine.transform(dir.path());

        assert!(!result.has_changes());
        assert!(converter.calls.lock().unwrap().is_empty());
        assert!(dir.path().join(".git/objects/x.png").exists());
    }

    #[test]
    fn test_walk_order_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.png", "a.png", "b.jpg"] {
            fs::write(dir.path().join(name), b"img").unwrap();
        }

        let (engine, _) = stub_engine();
        let result = engine.transform(dir.path());
        let order: Vec<_> = result.files_converted().map(Path::to_path_buf).collect();
        assert_eq!(
            order,
            vec![PathBuf::from("a.png"), PathBuf::from("b.jpg"), PathBuf::from("c.png")]
        );
    }

    #[test]
    fn test_swap_extension() {
        assert_eq!(swap_extension("img/a.b.PNG"), "img/a.b.webp");
        assert_eq!(swap_extension("noext"), "noext");
    }
}
